use std::time::Duration;

use crate::Result;
use crate::firmata::PinMode;

/// Digital pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(value: Level) -> Self {
        matches!(value, Level::High)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

/// Pin and I2C access to the coprocessor on the HAT.
///
/// Write style operations return once the write has been handed to the transport.
pub trait Board: Send {
    /// Resolve once the coprocessor reported its firmware version.
    fn wait_ready(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<FirmwareVersion>> + Send;

    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> impl Future<Output = Result<()>> + Send;

    fn digital_write(&mut self, pin: u8, level: Level) -> impl Future<Output = Result<()>> + Send;

    fn i2c_config(&mut self, delay_us: u16) -> impl Future<Output = Result<()>> + Send;

    /// Write raw bytes to an I2C device. Register addressed devices expect the register first.
    fn i2c_write(&mut self, addr: u8, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn i2c_read_once(
        &mut self,
        addr: u8,
        register: u8,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Release the transport. Further operations fail.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}
