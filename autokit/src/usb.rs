//! USB topology: port power toggling, boot-mode device discovery and the usbboot loader.

use std::{ffi::OsString, path::PathBuf, time::Duration};

use autokit_hotplug::{BlockDeviceAdapter, UsbBootDrive, UsbbootDeviceAdapter, Watcher};
use futures::{FutureExt, future::BoxFuture};

use crate::{Error, Result};

/// Switches power of the USB port the DUT hangs off. Failures are logged, never returned: a
/// missing toggle only makes the boot-mode trigger less reliable.
pub trait UsbToggle: Send + Sync {
    fn toggle(&self, on: bool) -> BoxFuture<'_, ()>;
}

/// Port power through the `uhubctl` binary, expected on `PATH`.
#[derive(Debug, Clone)]
pub struct Uhubctl {
    hub: String,
    port: u8,
}

impl Uhubctl {
    pub const DEFAULT_HUB: &str = "1-1";

    pub fn new(hub: impl Into<String>, port: u8) -> Self {
        Self {
            hub: hub.into(),
            port,
        }
    }

    fn args(&self, on: bool) -> Vec<String> {
        [
            "-r",
            "1000",
            "-a",
            if on { "on" } else { "off" },
            "-p",
            &self.port.to_string(),
            "-l",
            &self.hub,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

impl UsbToggle for Uhubctl {
    fn toggle(&self, on: bool) -> BoxFuture<'_, ()> {
        async move {
            tracing::info!("Toggling USB {}", if on { "on" } else { "off" });

            let res = tokio::process::Command::new("uhubctl")
                .args(self.args(on))
                .output()
                .await;

            match res {
                Ok(x) if x.status.success() => {}
                Ok(x) => tracing::warn!(
                    "Failed. Check that uhubctl is available. {}",
                    String::from_utf8_lossy(&x.stderr).trim()
                ),
                Err(e) => tracing::warn!("Failed. Check that uhubctl is available. {e}"),
            }
        }
        .boxed()
    }
}

/// Serves the second stage to a SoC sitting in the ROM USB boot loader. Once it runs, the
/// device detaches and comes back as a mass storage device.
pub trait BootLoader: Send + Sync {
    fn load<'a>(&'a self, dev: &'a UsbBootDrive) -> BoxFuture<'a, Result<()>>;
}

/// The `rpiboot` binary of the Raspberry Pi usbboot project, expected on `PATH`.
///
/// Without a directory, rpiboot serves its built-in mass storage gadget.
#[derive(Debug, Clone, Default)]
pub struct Rpiboot {
    dir: Option<PathBuf>,
}

impl Rpiboot {
    pub const fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn args(&self) -> Vec<OsString> {
        match &self.dir {
            Some(d) => vec!["-d".into(), d.into()],
            None => Vec::new(),
        }
    }
}

impl BootLoader for Rpiboot {
    fn load<'a>(&'a self, dev: &'a UsbBootDrive) -> BoxFuture<'a, Result<()>> {
        async move {
            tracing::info!("Sending usbboot second stage to {dev:?}");

            let out = tokio::process::Command::new("rpiboot")
                .args(self.args())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| Error::UsbBoot(format!("Failed to run rpiboot: {e}")))?;

            if !out.status.success() {
                return Err(Error::UsbBoot(format!(
                    "rpiboot failed ({}): {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }

            Ok(())
        }
        .boxed()
    }
}

/// Produces a fresh [`Watcher`] for every boot-mode attempt.
pub trait WatcherSource: Send + Sync {
    fn watch(&self) -> Watcher;
}

/// Polls block devices (system drives excluded) and USB boot-mode devices.
#[derive(Debug, Clone, Copy)]
pub struct DeviceScanner {
    interval: Duration,
}

impl DeviceScanner {
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl WatcherSource for DeviceScanner {
    fn watch(&self) -> Watcher {
        Watcher::start(
            vec![
                Box::new(BlockDeviceAdapter::new(false)),
                Box::new(UsbbootDeviceAdapter),
            ],
            self.interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Rpiboot, Uhubctl};

    #[test]
    fn uhubctl_args() {
        let u = Uhubctl::new(Uhubctl::DEFAULT_HUB, 4);
        assert_eq!(
            u.args(false),
            ["-r", "1000", "-a", "off", "-p", "4", "-l", "1-1"]
        );
        assert_eq!(u.args(true)[3], "on");
    }

    #[test]
    fn rpiboot_args() {
        assert!(Rpiboot::default().args().is_empty());
        assert_eq!(
            Rpiboot::new(Some(PathBuf::from("/opt/usbboot/mass-storage-gadget64"))).args(),
            ["-d", "/opt/usbboot/mass-storage-gadget64"]
        );
    }
}
