//! Hardware side of autokit: the tester HAT that sits between the host and the DUT.
//!
//! The HAT controls the DUT power rail (an MCP4725 DAC driving an adjustable regulator, read
//! back through an INA260), routes an SD card between the host and the DUT, and bridges the
//! DUT serial console. Pins and I2C are reached through a Firmata speaking coprocessor.
//!
//! [`Tester`] is the contract the rest of autokit relies on. [`TesterHat`] implements it on top
//! of any [`Board`], usually [`Firmata`] over the HAT serial port.

use std::{io, path::Path, time::Duration};

mod board;
pub mod firmata;
mod hat;
mod serial;

pub use board::{Board, FirmwareVersion, Level};
pub use firmata::Firmata;
pub use hat::{HatConfig, SerialConfig, TesterHat, dac_code, pins};
pub use serial::DutSerial;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Incorrect target value for Vout {0}. Allowed range is [1.3; 12] V.")]
    Range(f64),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("Tester transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Operations the orchestrator needs from a tester board.
///
/// Write style operations are confirmed flushed to the board before they return.
pub trait Tester: Send {
    /// Wait for the board and bring it into a known state: DUT off, SD routed to the DUT.
    fn setup(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Fails with [`Error::Range`] outside of [1.3, 12] V, without touching the hardware.
    fn set_vout(&mut self, volts: f64) -> impl Future<Output = Result<()>> + Send;

    fn read_vout(&mut self) -> impl Future<Output = Result<f64>> + Send;

    fn read_vout_amperage(&mut self) -> impl Future<Output = Result<f64>> + Send;

    fn power_on_dut(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn power_off_dut(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn switch_sd_to_dut(&mut self, settle: Duration) -> impl Future<Output = Result<()>> + Send;

    fn switch_sd_to_host(&mut self, settle: Duration) -> impl Future<Output = Result<()>> + Send;

    fn digital_write(&mut self, pin: u8, level: Level) -> impl Future<Output = Result<()>> + Send;

    fn i2c_write(
        &mut self,
        addr: u8,
        register: u8,
        data: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Output of the DUT serial console, if the tester has one. Opened on first use.
    fn open_dut_serial(&mut self) -> impl Future<Output = Result<Option<DutSerial>>> + Send;

    fn close_dut_serial(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Block device the tester exposes the SD card as, when routed to the host.
    fn sd_device(&self) -> &Path;

    /// Release the board transport.
    fn teardown_board(&mut self) -> impl Future<Output = Result<()>> + Send;
}
