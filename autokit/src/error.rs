use std::path::PathBuf;

use autokit_hotplug::{ScanError, WaitError};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Steps of a sequence that wait on the outside world with a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RawAttach,
    RawDetach,
    BlockAttach,
    InternalFlash,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::RawAttach => "raw-attach",
            Stage::RawDetach => "raw-detach",
            Stage::BlockAttach => "block-attach",
            Stage::InternalFlash => "internal-flash",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tester(#[from] autokit_tester::Error),
    #[error("Timed out while waiting for {0}")]
    Timeout(Stage),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Flashing failed with the following errors: {0}")]
    Flash(String),
    #[error("Another flash or power sequence is in progress")]
    FlashInProgress,
    #[error("Giving up after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
    #[error("Aborted before completing")]
    Aborted,
    #[error("USB boot: {0}")]
    UsbBoot(String),
    #[error("Cannot find {0} among the available drives")]
    DeviceNotFound(PathBuf),
    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Tester has been torn down")]
    TornDown,
    #[error("Network: {0}")]
    Network(String),
    #[error("Video capture: {0}")]
    Video(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn from_wait(stage: Stage, e: WaitError) -> Self {
        match e {
            WaitError::Timeout(_) => Self::Timeout(stage),
            WaitError::Scan(e) => Self::Scan(e),
            WaitError::Cancelled => Self::Aborted,
            WaitError::Closed => Self::Scan(ScanError(format!(
                "device watcher stopped during {stage}"
            ))),
        }
    }

    /// A missing block device, or a boot loader the device did not take, is worth another
    /// boot-mode attempt.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(Stage::BlockAttach) | Error::UsbBoot(_))
    }
}
