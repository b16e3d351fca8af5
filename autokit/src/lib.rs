//! # Introduction
//!
//! Autokit drives a device under test (DUT) through a tester HAT: it sets the DUT supply rail,
//! routes the SD card between the host and the DUT, toggles USB ports, writes OS images and
//! brings the DUT to a known power state.
//!
//! [`TestBot`] owns the tester for a session. [`devices::DeviceInteractor`] implements the power
//! and flashing sequences of each device family on top of it. [`Autokit`] ties both to a
//! [`config::AutokitConfig`].
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = autokit::config::AutokitConfig::load(Path::new("/etc/autokit.json"))
//!         .await
//!         .unwrap();
//!     let mut kit = autokit::Autokit::open(config).unwrap();
//!
//!     kit.setup().await.unwrap();
//!     kit.flash(Path::new("/tmp/os.img.xz"), None).await.unwrap();
//!     kit.power_on().await.unwrap();
//!     kit.teardown().await;
//! }
//! ```
//!
//! # Features
//!
//! - `network`: Access points for the DUT through NetworkManager. Enabled by **default**.

pub mod config;
pub mod devices;
mod error;
pub mod features;
mod flashing;
pub mod img;
mod testbot;
pub mod usb;

use std::path::Path;

use autokit_tester::{Firmata, Tester, TesterHat};
use futures::channel::mpsc;

pub use autokit_helper::resolvable::Resolvable;
pub use error::{Error, Result, Stage};
pub use flashing::Status;
pub use img::{LocalImage, OsImage};
pub use testbot::{BotTimings, TestBot};

use config::{AutokitConfig, VideoImpl};
use devices::{DeviceInteractor, DeviceKind, Timings};
use features::Video;
use usb::{BootLoader, DeviceScanner, Uhubctl, WatcherSource};

/// A configured tester session.
pub struct Autokit<T: Tester = TesterHat<Firmata>> {
    config: AutokitConfig,
    kind: DeviceKind,
    bot: TestBot<T>,
    usb: Option<Uhubctl>,
    watchers: Box<dyn WatcherSource>,
    loader: Box<dyn BootLoader>,
    timings: Timings,
    #[cfg(feature = "network")]
    network: Option<features::Network>,
    video: Option<Video>,
}

impl Autokit {
    /// Connect to the HAT named in `config`. Must be called from within a tokio runtime.
    pub fn open(config: AutokitConfig) -> Result<Self> {
        config.validate()?;
        let hat = TesterHat::open(config.hat_config())?;
        Self::new(config, hat)
    }
}

impl<T: Tester> Autokit<T> {
    pub fn new(config: AutokitConfig, tester: T) -> Result<Self> {
        config.validate()?;

        let video = match config.video {
            VideoImpl::LinuxVideo => Some(Video::new(&config.capture_dir)),
            VideoImpl::Disabled => None,
        };

        Ok(Self {
            kind: config.device_kind()?,
            bot: TestBot::new(tester),
            usb: config.usb_toggle(),
            watchers: Box::new(DeviceScanner::default()),
            loader: Box::new(config.boot_loader()),
            timings: Timings::default(),
            #[cfg(feature = "network")]
            network: None,
            video,
            config,
        })
    }

    pub fn with_watchers(mut self, watchers: Box<dyn WatcherSource>) -> Self {
        self.watchers = watchers;
        self
    }

    pub fn with_boot_loader(mut self, loader: Box<dyn BootLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub const fn config(&self) -> &AutokitConfig {
        &self.config
    }

    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub const fn bot(&self) -> &TestBot<T> {
        &self.bot
    }

    pub fn interactor(&self) -> DeviceInteractor<'_, T> {
        let i = DeviceInteractor::new(self.kind, &self.bot, self.watchers.as_ref())
            .with_boot_loader(self.loader.as_ref())
            .with_timings(self.timings);

        match &self.usb {
            Some(u) => i.with_usb(u),
            None => i,
        }
    }

    /// Bring the tester into a known state. Also connects to NetworkManager when enabled.
    pub async fn setup(&mut self) -> Result<()> {
        self.bot.setup().await?;

        #[cfg(feature = "network")]
        if self.config.network == config::NetworkImpl::LinuxNetwork {
            self.network = Some(features::Network::connect().await?);
        }

        tracing::info!("Autokit ready for {}", self.kind);
        Ok(())
    }

    /// Bring up the access points for the interfaces named in the configuration.
    #[cfg(feature = "network")]
    pub async fn start_network(&mut self) -> Result<()> {
        let Some(net) = self.network.as_mut() else {
            return Err(Error::Network("Network is disabled".to_string()));
        };

        if let Some(iface) = &self.config.wired_interface {
            net.add_wired_connection(iface).await?;
        }
        if let Some(iface) = &self.config.wireless_interface {
            net.add_wireless_connection(features::DEFAULT_SSID, features::DEFAULT_PSK, iface)
                .await?;
        }

        Ok(())
    }

    #[cfg(feature = "network")]
    pub fn network_mut(&mut self) -> Option<&mut features::Network> {
        self.network.as_mut()
    }

    pub fn video_mut(&mut self) -> Option<&mut Video> {
        self.video.as_mut()
    }

    pub async fn flash(&self, image: &Path, chan: Option<mpsc::Sender<Status>>) -> Result<()> {
        self.interactor().flash_from_file(image, chan).await
    }

    pub async fn power_on(&self) -> Result<()> {
        self.interactor().power_on().await
    }

    pub async fn power_off(&self) -> Result<()> {
        self.interactor().power_off().await
    }

    /// Rail voltage (V) and current (A).
    pub async fn read_power(&self) -> Result<(f64, f64)> {
        let mut t = self.bot.tester().await;
        let volts = t.read_vout().await?;
        let amps = t.read_vout_amperage().await?;
        Ok((volts, amps))
    }

    /// Stop collaborators and release the tester. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if let Some(v) = self.video.as_mut().filter(|v| v.is_capturing()) {
            if let Err(e) = v.stop_capture().await {
                tracing::warn!("Failed to stop video capture: {e}");
            }
        }

        #[cfg(feature = "network")]
        if let Some(net) = self.network.as_mut() {
            net.teardown().await;
        }

        self.bot.teardown(true).await;
    }
}
