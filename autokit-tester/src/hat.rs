use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use autokit_helper::retry::RetryPolicy;
use tokio_serial::SerialPortBuilderExt;

use crate::{
    Board, DutSerial, Error, Firmata, Level, Result, Tester,
    firmata::{self, PinMode},
    serial::{self, SerialBridge},
};

pub mod pins {
    pub const SD_RESET_N: u8 = 0;
    /// Low routes the SD card to the DUT, high to the host.
    pub const SD_MUX_SEL: u8 = 2;
    pub const OE_TXB: u8 = 13;
    pub const DUT_PW_EN: u8 = 14;
    pub const OE_TXS: u8 = 15;

    pub(crate) const ALL: [u8; 5] = [SD_RESET_N, SD_MUX_SEL, OE_TXB, DUT_PW_EN, OE_TXS];
}

const VOUT_MIN: f64 = 1.3;
const VOUT_MAX: f64 = 12.0;
const VDAC_MAX: f64 = 3.3;
const DIN_MAX: f64 = 4095.0;

const DAC_REGISTER: u8 = 0x40;

const SENSOR_ADDRESS: u8 = 0x40;
const SENSOR_CURRENT: u8 = 0x01;
const SENSOR_VOLTAGE: u8 = 0x02;
/// Both INA260 registers have an LSB of 1.25 mA / 1.25 mV.
const SENSOR_LSB: f64 = 0.00125;

/// DAC input for a target rail voltage. The formula depends on the resistors of the HAT's
/// adjustable regulator.
pub fn dac_code(target: f64) -> Result<u16> {
    if !(VOUT_MIN..=VOUT_MAX).contains(&target) {
        return Err(Error::Range(target));
    }

    let vdac = (13.57 - target) / 3.72;
    let code = (DIN_MAX * vdac / VDAC_MAX).floor().clamp(0.0, DIN_MAX);

    Ok(code as u16)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub path: PathBuf,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/ttyAMA0"),
            baud_rate: 115200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HatConfig {
    /// Serial port of the coprocessor.
    pub transport: PathBuf,
    /// I2C address of the PSU DAC. Depends on resistors on the board.
    pub psu_address: u8,
    pub sd_device: PathBuf,
    pub dut_serial: Option<SerialConfig>,
    pub ready_timeout: Duration,
    /// Used to wait for device nodes to show up.
    pub path_retry: RetryPolicy,
}

impl Default for HatConfig {
    fn default() -> Self {
        Self {
            transport: PathBuf::from("/dev/ttyS0"),
            psu_address: 0x61,
            sd_device: PathBuf::from(
                "/dev/disk/by-id/usb-Generic_Ultra_HS-SD_MMC_000008264001-0:0",
            ),
            dut_serial: Some(SerialConfig::default()),
            ready_timeout: Duration::from_secs(10),
            path_retry: RetryPolicy::default(),
        }
    }
}

/// The testbot HAT.
pub struct TesterHat<B> {
    board: B,
    config: HatConfig,
    dut_serial: Option<SerialBridge>,
}

impl TesterHat<Firmata> {
    /// Connect to the coprocessor over `config.transport`. Must be called from within a tokio
    /// runtime.
    pub fn open(config: HatConfig) -> Result<Self> {
        let port = tokio_serial::new(config.transport.to_string_lossy(), firmata::BAUD_RATE)
            .open_native_async()
            .map_err(|e| Error::Transport(format!("{}: {e}", config.transport.display())))?;

        Ok(Self::new(Firmata::new(port), config))
    }
}

impl<B: Board> TesterHat<B> {
    pub const fn new(board: B, config: HatConfig) -> Self {
        Self {
            board,
            config,
            dut_serial: None,
        }
    }

    pub const fn config(&self) -> &HatConfig {
        &self.config
    }

    /// Active-low pulse on the hub reset. The mux recovers within 500us, and each write takes
    /// longer than that to be confirmed.
    async fn reset_hub(&mut self) -> Result<()> {
        tracing::debug!("Start resetting the hub");
        self.board.digital_write(pins::SD_RESET_N, Level::Low).await?;
        self.board.digital_write(pins::SD_RESET_N, Level::High).await?;
        tracing::debug!("Completed resetting the hub");
        Ok(())
    }

    async fn switch_sd(&mut self, level: Level, settle: Duration) -> Result<()> {
        self.board.digital_write(pins::SD_MUX_SEL, level).await?;
        self.reset_hub().await?;
        tokio::time::sleep(settle).await;
        Ok(())
    }

    async fn read_sensor(&mut self, register: u8) -> Result<f64> {
        let data = self.board.i2c_read_once(SENSOR_ADDRESS, register, 2).await?;
        match data[..] {
            [msb, lsb, ..] => Ok(f64::from(u16::from_be_bytes([msb, lsb])) * SENSOR_LSB),
            _ => Err(Error::Transport(format!(
                "Short read from current sensor: {} bytes",
                data.len()
            ))),
        }
    }
}

impl<B: Board> Tester for TesterHat<B> {
    async fn setup(&mut self) -> Result<()> {
        let version = self.board.wait_ready(self.config.ready_timeout).await?;
        tracing::info!(
            "Firmata {}.{} connection established",
            version.major,
            version.minor
        );

        for pin in pins::ALL {
            self.board.pin_mode(pin, PinMode::Output).await?;
        }

        self.power_off_dut().await?;
        // This also resets the USB hub.
        self.switch_sd_to_dut(Duration::ZERO).await?;

        tracing::info!("testbot is ready!");
        Ok(())
    }

    async fn set_vout(&mut self, volts: f64) -> Result<()> {
        let code = dac_code(volts)?;
        tracing::info!("requested Vout={volts} Din={code}");

        self.board.i2c_config(0).await?;
        self.i2c_write(
            self.config.psu_address,
            DAC_REGISTER,
            &[(code >> 4) as u8, ((code & 0x0f) << 4) as u8],
        )
        .await
    }

    async fn read_vout(&mut self) -> Result<f64> {
        self.read_sensor(SENSOR_VOLTAGE).await
    }

    async fn read_vout_amperage(&mut self) -> Result<f64> {
        self.read_sensor(SENSOR_CURRENT).await
    }

    async fn power_on_dut(&mut self) -> Result<()> {
        tracing::info!("Switching DUT on...");
        self.board.digital_write(pins::DUT_PW_EN, Level::High).await
    }

    async fn power_off_dut(&mut self) -> Result<()> {
        tracing::info!("Switching DUT off...");
        self.board.digital_write(pins::DUT_PW_EN, Level::Low).await
    }

    async fn switch_sd_to_dut(&mut self, settle: Duration) -> Result<()> {
        tracing::info!("Switching SD card to device...");
        self.switch_sd(Level::Low, settle).await
    }

    async fn switch_sd_to_host(&mut self, settle: Duration) -> Result<()> {
        tracing::info!("Switching SD card to host...");
        self.switch_sd(Level::High, settle).await
    }

    async fn digital_write(&mut self, pin: u8, level: Level) -> Result<()> {
        self.board.digital_write(pin, level).await
    }

    async fn i2c_write(&mut self, addr: u8, register: u8, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(register);
        buf.extend_from_slice(data);

        self.board.i2c_write(addr, &buf).await
    }

    async fn open_dut_serial(&mut self) -> Result<Option<DutSerial>> {
        if let Some(x) = &self.dut_serial {
            return Ok(Some(x.subscribe()));
        }

        let Some(cfg) = self.config.dut_serial.clone() else {
            return Ok(None);
        };

        // Two level shifters sit between the DUT UART and the host.
        self.board.digital_write(pins::OE_TXB, Level::High).await?;
        self.board.digital_write(pins::OE_TXS, Level::High).await?;

        let Some(bridge) = serial::open(&cfg.path, cfg.baud_rate, self.config.path_retry).await?
        else {
            return Ok(None);
        };
        let res = bridge.subscribe();
        self.dut_serial = Some(bridge);

        Ok(Some(res))
    }

    async fn close_dut_serial(&mut self) -> Result<()> {
        match self.dut_serial.take() {
            Some(_) => tracing::info!("DUT serial port is closed"),
            None => tracing::debug!("DUT serial port was not opened before"),
        }
        Ok(())
    }

    fn sd_device(&self) -> &Path {
        &self.config.sd_device
    }

    async fn teardown_board(&mut self) -> Result<()> {
        self.board.close().await?;
        tracing::info!("HAT teardown is completed");
        Ok(())
    }
}
