//! Per device family power and flashing sequences.
//!
//! Families that flash from the tester's SD slot ([`DeviceKind::RaspberryPi`],
//! [`DeviceKind::BeagleBone`], [`DeviceKind::IntelNuc`]) only need the [`TestBot`]. The others
//! are put into USB boot mode and flashed as a mass storage device once they reattach.

use std::{io::Read, path::Path, str::FromStr, time::Duration};

use autokit_helper::resolvable::Resolvable;
use autokit_hotplug::{BlockDevice, COMPUTE_MODULE, Node, Watcher};
use autokit_tester::Tester;
use futures::channel::mpsc;
use tokio::time::Instant;

use crate::{
    Error, Result, Stage, TestBot,
    flashing::Status,
    img::LocalImage,
    testbot::FlashJob,
    usb::{BootLoader, UsbToggle, WatcherSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    RaspberryPi,
    BeagleBone,
    BalenaFin,
    BalenaFinV09,
    IntelNuc,
    UsbBoot,
}

impl DeviceKind {
    pub const fn power_voltage(&self) -> f64 {
        match self {
            DeviceKind::RaspberryPi | DeviceKind::BeagleBone | DeviceKind::UsbBoot => 5.0,
            DeviceKind::BalenaFin | DeviceKind::BalenaFinV09 | DeviceKind::IntelNuc => 12.0,
        }
    }

    pub const fn boot_trigger(&self) -> Option<BootTrigger> {
        match self {
            DeviceKind::BalenaFin => Some(BootTrigger::FinV10),
            DeviceKind::BalenaFinV09 => Some(BootTrigger::FinV09),
            DeviceKind::UsbBoot => Some(BootTrigger::Generic),
            DeviceKind::RaspberryPi | DeviceKind::BeagleBone | DeviceKind::IntelNuc => None,
        }
    }

    /// Whether flashing goes through a USB port toggle.
    pub const fn needs_usb_port(&self) -> bool {
        self.boot_trigger().is_some()
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "fincm3" | "balena-fin" => DeviceKind::BalenaFin,
            "fincm3-v09" | "balena-fin-v09" => DeviceKind::BalenaFinV09,
            "intel-nuc" => DeviceKind::IntelNuc,
            "usbboot" | "raspberrypicm4-ioboard" | "revpi-core-3" => DeviceKind::UsbBoot,
            "rpi" => DeviceKind::RaspberryPi,
            x if x.starts_with("genericx86-64") => DeviceKind::IntelNuc,
            x if x.starts_with("beaglebone") => DeviceKind::BeagleBone,
            x if x.starts_with("raspberrypi") => DeviceKind::RaspberryPi,
            x => return Err(Error::Config(format!("Unknown device type {x:?}"))),
        };
        Ok(kind)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceKind::RaspberryPi => "Raspberry Pi",
            DeviceKind::BeagleBone => "BeagleBone",
            DeviceKind::BalenaFin => "balenaFin",
            DeviceKind::BalenaFinV09 => "balenaFin v1.0.0",
            DeviceKind::IntelNuc => "Intel NUC",
            DeviceKind::UsbBoot => "USB boot device",
        };
        f.write_str(s)
    }
}

/// The power sequence that makes a DUT enumerate as a USB boot-mode device.
///
/// The V09 sequence can damage V10+ boards, so the two are never interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTrigger {
    /// Port off, 8 s, port on.
    FinV10,
    /// Port off, 1 s, port on, then power the DUT.
    FinV09,
    /// Port off, 2 s, port on.
    Generic,
}

/// Delays and bounds of the sequences. The defaults are the values the hardware needs; tests
/// shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub sd_settle: Duration,
    pub internal_sd_settle: Duration,
    pub internal_flash_start: Duration,
    pub current_poll: Duration,
    pub internal_flash_timeout: Duration,
    /// DUT is considered idle at or below this draw, in amperes.
    pub idle_current: f64,
    /// Between cutting power and triggering boot mode. Fins.
    pub fin_quiesce: Duration,
    /// Between cutting power and triggering boot mode. Generic usbboot devices.
    pub generic_quiesce: Duration,
    pub fin_v10_port_off: Duration,
    pub fin_v09_port_off: Duration,
    pub generic_port_off: Duration,
    /// Port off before powering a fin normally.
    pub fin_power_on_delay: Duration,
    pub block_attach_timeout: Duration,
    pub pre_flash_delay: Duration,
    pub flash_attempts: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            sd_settle: Duration::from_secs(1),
            internal_sd_settle: Duration::from_secs(5),
            internal_flash_start: Duration::from_secs(5),
            current_poll: Duration::from_secs(5),
            internal_flash_timeout: Duration::from_secs(6 * 60),
            idle_current: 0.1,
            fin_quiesce: Duration::from_secs(1),
            generic_quiesce: Duration::from_secs(8),
            fin_v10_port_off: Duration::from_secs(8),
            fin_v09_port_off: Duration::from_secs(1),
            generic_port_off: Duration::from_secs(2),
            fin_power_on_delay: Duration::from_secs(8),
            block_attach_timeout: Duration::from_secs(5 * 60),
            pre_flash_delay: Duration::from_secs(1),
            flash_attempts: 3,
        }
    }
}

/// Drives one DUT through its family's sequences. Borrows everything; cheap to create per
/// operation.
///
/// `power_on`, `flash` and `wait_internal_flash` hold the bot's flash slot from start to end, so
/// they never overlap each other or a direct [`TestBot`] flash.
pub struct DeviceInteractor<'a, T: Tester> {
    kind: DeviceKind,
    bot: &'a TestBot<T>,
    watchers: &'a dyn WatcherSource,
    usb: Option<&'a dyn UsbToggle>,
    loader: Option<&'a dyn BootLoader>,
    timings: Timings,
}

impl<'a, T: Tester> DeviceInteractor<'a, T> {
    pub fn new(kind: DeviceKind, bot: &'a TestBot<T>, watchers: &'a dyn WatcherSource) -> Self {
        Self {
            kind,
            bot,
            watchers,
            usb: None,
            loader: None,
            timings: Timings::default(),
        }
    }

    pub fn with_usb(mut self, usb: &'a dyn UsbToggle) -> Self {
        self.usb = Some(usb);
        self
    }

    /// Second stage loader for boot-mode devices. Without one the device is expected to be
    /// served by something else, like an `rpiboot -l` running on the host.
    pub fn with_boot_loader(mut self, loader: &'a dyn BootLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub async fn power_on(&self) -> Result<()> {
        let _job = self.bot.begin_flash()?;
        tracing::info!("Powering on {}", self.kind);

        match self.kind {
            DeviceKind::RaspberryPi => {
                let mut t = self.bot.tester().await;
                t.set_vout(self.kind.power_voltage()).await?;
                t.switch_sd_to_dut(self.timings.sd_settle).await?;
                t.power_on_dut().await?;
            }
            DeviceKind::BeagleBone | DeviceKind::UsbBoot => self.power_on_at_voltage().await?,
            DeviceKind::IntelNuc => {
                self.internal_flash().await?;
                tracing::info!("Powering on DUT - should now boot from internal storage");
                self.bot.tester().await.power_on_dut().await?;
            }
            DeviceKind::BalenaFin | DeviceKind::BalenaFinV09 => {
                self.usb()?.toggle(false).await;
                self.sleep(self.timings.fin_power_on_delay).await?;
                self.power_on_at_voltage().await?;
            }
        }

        Ok(())
    }

    pub async fn power_off(&self) -> Result<()> {
        tracing::info!("Powering off {}", self.kind);
        self.bot.power_off().await
    }

    pub async fn flash<I, R>(&self, img: &I, chan: Option<mpsc::Sender<Status>>) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        let job = self.bot.begin_flash()?;

        match self.kind.boot_trigger() {
            Some(trigger) => return self.flash_usb_boot(&job, img, chan, trigger).await,
            None if self.kind == DeviceKind::BeagleBone => {}
            None => return self.bot.flash_sd(&job, img, chan).await,
        }

        self.power_off().await?;
        self.bot.flash_sd(&job, img, chan).await?;
        self.internal_flash().await?;
        self.power_off().await?;
        self.bot
            .tester()
            .await
            .switch_sd_to_host(self.timings.sd_settle)
            .await?;

        Ok(())
    }

    pub async fn flash_from_file(
        &self,
        path: &Path,
        chan: Option<mpsc::Sender<Status>>,
    ) -> Result<()> {
        let img = LocalImage::new(path.into());
        tracing::info!("Flashing {img} to {}", self.kind);
        self.flash(&img, chan).await
    }

    /// Boot the DUT from the SD card and wait until it stops drawing current, which is how
    /// images that copy themselves to internal storage signal completion.
    pub async fn wait_internal_flash(&self) -> Result<()> {
        let _job = self.bot.begin_flash()?;
        self.internal_flash().await
    }

    async fn internal_flash(&self) -> Result<()> {
        self.power_off().await?;
        {
            let mut t = self.bot.tester().await;
            t.set_vout(self.kind.power_voltage()).await?;
            t.switch_sd_to_dut(self.timings.internal_sd_settle).await?;
            t.power_on_dut().await?;
        }

        tracing::info!("Waiting for DUT to flash its internal storage");
        self.sleep(self.timings.internal_flash_start).await?;

        let start = Instant::now();
        let mut current = self.bot.tester().await.read_vout_amperage().await?;
        tracing::info!("Initial current measurement: {current} A");

        while current > self.timings.idle_current {
            if start.elapsed() >= self.timings.internal_flash_timeout {
                tracing::error!("Timed out while waiting for DUT to flash");
                return Err(Error::Timeout(Stage::InternalFlash));
            }

            self.sleep(self.timings.current_poll).await?;
            current = self.bot.tester().await.read_vout_amperage().await?;
            tracing::debug!("Current measurement: {current} A");
        }

        tracing::info!("Internal flashing done");
        self.power_off().await?;
        self.bot
            .tester()
            .await
            .switch_sd_to_host(self.timings.sd_settle)
            .await?;

        Ok(())
    }

    async fn flash_usb_boot<I, R>(
        &self,
        job: &FlashJob,
        img: &I,
        chan: Option<mpsc::Sender<Status>>,
        trigger: BootTrigger,
    ) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        let usb = self.usb()?;
        let attempts = self.timings.flash_attempts.max(1);
        let mut res = Err(Error::RetriesExhausted { attempts });

        for attempt in 1..=attempts {
            tracing::info!("Flashing {}, attempt {attempt}/{attempts}", self.kind);

            match self.usb_boot_attempt(job, usb, img, chan.clone(), trigger).await {
                Ok(()) => {
                    tracing::info!("Flashed!");
                    res = Ok(());
                    break;
                }
                Err(e) if e.is_retryable() => tracing::warn!("Attempt {attempt} failed: {e}"),
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }

        // Leave the DUT entirely powered off, whatever happened.
        usb.toggle(false).await;
        let off = self.power_off().await;

        res?;
        off
    }

    async fn usb_boot_attempt<I, R>(
        &self,
        job: &FlashJob,
        usb: &dyn UsbToggle,
        img: &I,
        chan: Option<mpsc::Sender<Status>>,
        trigger: BootTrigger,
    ) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        usb.toggle(false).await;
        self.bot.tester().await.power_off_dut().await?;

        let quiesce = match trigger {
            BootTrigger::FinV10 | BootTrigger::FinV09 => self.timings.fin_quiesce,
            BootTrigger::Generic => self.timings.generic_quiesce,
        };
        self.sleep(quiesce).await?;

        self.trigger_boot_mode(usb, trigger).await?;

        let mut watcher = self.watchers.watch();
        let dev = self.locate_block_device(&mut watcher).await;
        watcher.stop();
        let dev = dev?;

        self.sleep(self.timings.pre_flash_delay).await?;
        tracing::info!("Flashing started...");
        self.bot.write_to(job, &dev.path, img, chan).await
    }

    async fn trigger_boot_mode(&self, usb: &dyn UsbToggle, trigger: BootTrigger) -> Result<()> {
        let port_off = match trigger {
            BootTrigger::FinV10 => self.timings.fin_v10_port_off,
            BootTrigger::FinV09 => self.timings.fin_v09_port_off,
            BootTrigger::Generic => self.timings.generic_port_off,
        };

        usb.toggle(false).await;
        self.sleep(port_off).await?;
        usb.toggle(true).await;

        if trigger == BootTrigger::FinV09 {
            self.power_on_at_voltage().await?;
        }

        Ok(())
    }

    /// Raw attach, second stage load, raw detach, then the block device reattach. Only the last
    /// step is bounded.
    async fn locate_block_device(&self, watcher: &mut Watcher) -> Result<BlockDevice> {
        let cancel = self.bot.cancel_token();

        tracing::info!("Waiting for compute module");
        let raw = watcher
            .wait_for_attach(Node::is_usb_boot, None, &cancel)
            .await
            .map_err(|e| Error::from_wait(Stage::RawAttach, e))?;
        tracing::info!("Compute module attached: {raw}");

        if let (Some(loader), Node::UsbBoot(dev)) = (self.loader, &raw) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                res = loader.load(dev) => res?,
            }
        }

        watcher
            .wait_for_detach(&raw, None, &cancel)
            .await
            .map_err(|e| Error::from_wait(Stage::RawDetach, e))?;

        tracing::info!("Waiting for compute module to reattach as a block device");
        let node = watcher
            .wait_for_attach(
                |n| n.as_block().is_some_and(|b| b.description == COMPUTE_MODULE),
                Some(self.timings.block_attach_timeout),
                &cancel,
            )
            .await
            .map_err(|e| Error::from_wait(Stage::BlockAttach, e))?;

        match node {
            Node::Block(b) => {
                tracing::info!("Attached compute module at {}", b.path.display());
                Ok(b)
            }
            Node::UsbBoot(_) => Err(Error::Timeout(Stage::BlockAttach)),
        }
    }

    async fn power_on_at_voltage(&self) -> Result<()> {
        let mut t = self.bot.tester().await;
        t.set_vout(self.kind.power_voltage()).await?;
        t.power_on_dut().await?;
        Ok(())
    }

    fn usb(&self) -> Result<&'a dyn UsbToggle> {
        self.usb.ok_or_else(|| {
            Error::Config(format!("No USB port specified for {}", self.kind))
        })
    }

    async fn sleep(&self, d: Duration) -> Result<()> {
        let cancel = self.bot.cancel_token();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Aborted),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }
}
