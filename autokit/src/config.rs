//! Session configuration, read from a JSON file.
//!
//! Every field has a default, so `{}` is a valid configuration for a Raspberry Pi on a testbot
//! HAT.

use std::{path::PathBuf, time::Duration};

use autokit_tester::{HatConfig, SerialConfig};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    devices::DeviceKind,
    features::Video,
    usb::{Rpiboot, Uhubctl},
};

/// Power rail implementation.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PowerImpl {
    #[default]
    TestbotHat,
}

/// SD card mux implementation.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SdMuxImpl {
    #[default]
    TestbotHat,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NetworkImpl {
    #[default]
    LinuxNetwork,
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VideoImpl {
    #[default]
    LinuxVideo,
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutokitConfig {
    pub power: PowerImpl,
    pub sd_mux: SdMuxImpl,
    pub network: NetworkImpl,
    pub video: VideoImpl,
    pub device_type: String,
    /// Port of the USB hub the DUT is attached to. Required for USB boot devices.
    pub usb_boot_port: Option<u8>,
    pub usb_hub: String,
    /// Second stage files handed to `rpiboot -d`. `None` uses rpiboot's built-in mass storage
    /// gadget.
    pub usbboot_dir: Option<PathBuf>,
    pub tester: TesterSettings,
    pub wired_interface: Option<String>,
    pub wireless_interface: Option<String>,
    pub capture_dir: PathBuf,
}

impl Default for AutokitConfig {
    fn default() -> Self {
        Self {
            power: PowerImpl::default(),
            sd_mux: SdMuxImpl::default(),
            network: NetworkImpl::default(),
            video: VideoImpl::default(),
            device_type: "raspberrypi4-64".to_string(),
            usb_boot_port: None,
            usb_hub: Uhubctl::DEFAULT_HUB.to_string(),
            usbboot_dir: None,
            tester: TesterSettings::default(),
            wired_interface: None,
            wireless_interface: None,
            capture_dir: PathBuf::from(Video::DEFAULT_CAPTURE_DIR),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TesterSettings {
    /// Serial port of the HAT coprocessor.
    pub transport: PathBuf,
    pub sd_device: PathBuf,
    pub psu_address: u8,
    /// `None` disables the DUT serial console.
    pub dut_serial: Option<PathBuf>,
    pub dut_baud_rate: u32,
    /// Seconds to wait for the coprocessor to report its firmware.
    pub ready_timeout: u64,
}

impl Default for TesterSettings {
    fn default() -> Self {
        let hat = HatConfig::default();
        let serial = SerialConfig::default();

        Self {
            transport: hat.transport,
            sd_device: hat.sd_device,
            psu_address: hat.psu_address,
            dut_serial: Some(serial.path),
            dut_baud_rate: serial.baud_rate,
            ready_timeout: hat.ready_timeout.as_secs(),
        }
    }
}

impl AutokitConfig {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Config(e.to_string()))
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    pub fn device_kind(&self) -> Result<DeviceKind> {
        self.device_type.parse()
    }

    pub fn hat_config(&self) -> HatConfig {
        let t = &self.tester;

        HatConfig {
            transport: t.transport.clone(),
            psu_address: t.psu_address,
            sd_device: t.sd_device.clone(),
            dut_serial: t.dut_serial.clone().map(|path| SerialConfig {
                path,
                baud_rate: t.dut_baud_rate,
            }),
            ready_timeout: Duration::from_secs(t.ready_timeout),
            ..HatConfig::default()
        }
    }

    pub fn usb_toggle(&self) -> Option<Uhubctl> {
        self.usb_boot_port
            .map(|port| Uhubctl::new(self.usb_hub.clone(), port))
    }

    pub fn boot_loader(&self) -> Rpiboot {
        Rpiboot::new(self.usbboot_dir.clone())
    }

    /// Check that the combination makes sense before touching any hardware.
    pub fn validate(&self) -> Result<()> {
        let kind = self.device_kind()?;
        if kind.needs_usb_port() && self.usb_boot_port.is_none() {
            return Err(Error::Config(format!(
                "{kind} is flashed over USB boot, usbBootPort is required"
            )));
        }
        Ok(())
    }
}
