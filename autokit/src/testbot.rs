//! Session level ownership of the tester: serialised hardware access, the single flash slot and
//! teardown.

use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use autokit_helper::{
    resolvable::Resolvable,
    retry::{RetryPolicy, with_retry},
};
use autokit_hotplug::{Adapter, BlockDevice, BlockDeviceAdapter, Node};
use autokit_tester::Tester;
use futures::channel::mpsc;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result, flashing::Status};

#[derive(Debug, Clone, Copy)]
pub struct BotTimings {
    /// Settle time after routing the SD card to the host, before looking for the drive.
    pub host_settle: Duration,
    /// Resolving the SD card's stable path. The by-id link shows up a while after the switch.
    pub path_retry: RetryPolicy,
    /// How long teardown waits for a cancelled flash to stop writing before it releases the
    /// hardware anyway.
    pub flash_stop: Duration,
}

impl Default for BotTimings {
    fn default() -> Self {
        Self {
            host_settle: Duration::from_secs(5),
            path_retry: RetryPolicy::default(),
            flash_stop: Duration::from_secs(30),
        }
    }
}

/// Owner of a tester for one session.
///
/// Hardware operations are serialised through [`TestBot::tester`]. At most one flash or power
/// sequence runs at a time, and [`TestBot::teardown`] cancels it.
pub struct TestBot<T: Tester> {
    tester: Mutex<T>,
    active_flash: Arc<Slot>,
    torn_down: AtomicBool,
    shutdown: CancellationToken,
    drives: Arc<dyn Adapter>,
    timings: BotTimings,
}

impl<T: Tester> TestBot<T> {
    pub fn new(tester: T) -> Self {
        Self {
            tester: Mutex::new(tester),
            active_flash: Arc::new(watch::Sender::new(None)),
            torn_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            drives: Arc::new(BlockDeviceAdapter::new(false)),
            timings: BotTimings::default(),
        }
    }

    /// Where [`TestBot::flash`] looks for the SD card once it is routed to the host.
    pub fn with_drive_source(mut self, drives: Arc<dyn Adapter>) -> Self {
        self.drives = drives;
        self
    }

    pub fn with_timings(mut self, timings: BotTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Exclusive access to the tester. Keep the guard for a single step of a sequence.
    pub async fn tester(&self) -> MutexGuard<'_, T> {
        self.tester.lock().await
    }

    /// Cancelled once the session is torn down. Long waits should observe it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Whether a sequence holds the flash slot, or a cancelled write is still winding down.
    pub fn is_flashing(&self) -> bool {
        self.active_flash.borrow().is_some()
    }

    /// Wait until the flash slot is free. Returns `false` if it is still taken after `limit`.
    pub async fn wait_flash_idle(&self, limit: Duration) -> bool {
        let mut rx = self.active_flash.subscribe();
        matches!(
            tokio::time::timeout(limit, rx.wait_for(Option::is_none)).await,
            Ok(Ok(_))
        )
    }

    pub async fn setup(&self) -> Result<()> {
        if self.is_torn_down() {
            return Err(Error::TornDown);
        }
        self.tester().await.setup().await?;
        Ok(())
    }

    /// Close the DUT serial console and cut power.
    pub async fn power_off(&self) -> Result<()> {
        let mut t = self.tester().await;
        t.close_dut_serial().await?;
        t.power_off_dut().await?;
        Ok(())
    }

    /// Flash the tester's SD card: route it to the host, find the drive, write and verify.
    pub async fn flash<I, R>(&self, img: &I, chan: Option<mpsc::Sender<Status>>) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        let job = self.begin_flash()?;
        self.flash_sd(&job, img, chan).await
    }

    pub(crate) async fn flash_sd<I, R>(
        &self,
        job: &FlashJob,
        img: &I,
        chan: Option<mpsc::Sender<Status>>,
    ) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        let sd = {
            let mut t = self.tester().await;
            t.switch_sd_to_host(self.timings.host_settle).await?;
            t.sd_device().to_path_buf()
        };

        let drive = self.find_drive(&sd).await?;
        tracing::info!("Start flashing the image to {}", drive.path.display());

        crate::flashing::write_image(img, drive.path, chan, job).await?;
        tracing::info!("Flashing completed");
        Ok(())
    }

    /// Flash an already located block device.
    pub async fn flash_to<I, R>(
        &self,
        dst: &Path,
        img: &I,
        chan: Option<mpsc::Sender<Status>>,
    ) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        let job = self.begin_flash()?;
        self.write_to(&job, dst, img, chan).await
    }

    pub(crate) async fn write_to<I, R>(
        &self,
        job: &FlashJob,
        dst: &Path,
        img: &I,
        chan: Option<mpsc::Sender<Status>>,
    ) -> Result<()>
    where
        I: Resolvable<ResolvedType = (R, u64)> + Sync,
        R: Read + Send + 'static,
    {
        crate::flashing::write_image(img, dst.to_path_buf(), chan, job).await
    }

    /// Release the hardware: cancel the active flash and wait for its writer to stop, close the
    /// serial console, power the DUT off and hand the SD card back to it. With `destroy` the
    /// board transport is closed too.
    ///
    /// Every step is attempted even when an earlier one fails. Only the first call does
    /// anything.
    pub async fn teardown(&self, destroy: bool) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("Tester already torn down");
            return;
        }

        self.shutdown.cancel();
        if !self.wait_flash_idle(self.timings.flash_stop).await {
            tracing::warn!(
                "Flash still running {:?} after cancellation",
                self.timings.flash_stop
            );
        }

        let mut t = self.tester().await;
        if let Err(e) = t.close_dut_serial().await {
            tracing::warn!("Failed to close DUT serial: {e}");
        }
        if let Err(e) = t.power_off_dut().await {
            tracing::warn!("Failed to power off DUT: {e}");
        }
        if let Err(e) = t.switch_sd_to_dut(Duration::ZERO).await {
            tracing::warn!("Failed to switch SD card to DUT: {e}");
        }
        if destroy {
            if let Err(e) = t.teardown_board().await {
                tracing::warn!("Failed to release tester board: {e}");
            }
        }

        tracing::info!("Tester torn down");
    }

    /// Take the flash slot for a whole sequence.
    pub(crate) fn begin_flash(&self) -> Result<FlashJob> {
        if self.is_torn_down() {
            return Err(Error::TornDown);
        }

        let token = self.shutdown.child_token();
        let claimed = self.active_flash.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(token.clone());
            true
        });
        if !claimed {
            return Err(Error::FlashInProgress);
        }

        Ok(FlashJob {
            lease: Arc::new(JobLease {
                slot: self.active_flash.clone(),
                token,
            }),
        })
    }

    async fn find_drive(&self, sd: &Path) -> Result<BlockDevice> {
        let dev: PathBuf = with_retry(self.timings.path_retry, || tokio::fs::canonicalize(sd))
            .await
            .map_err(|e| {
                tracing::error!("Failed to resolve {}: {e}", sd.display());
                Error::DeviceNotFound(sd.to_path_buf())
            })?;
        tracing::debug!("{} resolved to {}", sd.display(), dev.display());

        let drives = self.drives.clone();
        let nodes = tokio::task::spawn_blocking(move || drives.scan())
            .await
            .map_err(std::io::Error::other)??;

        nodes
            .into_iter()
            .filter_map(|n| match n {
                Node::Block(b) => Some(b),
                Node::UsbBoot(_) => None,
            })
            .find(|b| b.path == dev)
            .ok_or(Error::DeviceNotFound(dev))
    }
}

type Slot = watch::Sender<Option<CancellationToken>>;

/// A sequence's hold on the flash slot. Dropping it cancels the job.
///
/// The slot itself stays taken until every [`JobLease`] is gone, including the one moved into
/// the blocking writer, so an abandoned write cannot overlap the next one.
pub(crate) struct FlashJob {
    lease: Arc<JobLease>,
}

impl FlashJob {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.lease.token
    }

    pub(crate) fn lease(&self) -> Arc<JobLease> {
        self.lease.clone()
    }
}

impl Drop for FlashJob {
    fn drop(&mut self) {
        self.lease.token.cancel();
    }
}

pub(crate) struct JobLease {
    slot: Arc<Slot>,
    token: CancellationToken,
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.slot.send_replace(None);
    }
}
