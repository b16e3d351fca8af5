//! Library to write OS images to block devices (SD cards, USB mass storage). Powers the flashing
//! step of the autokit tester.
//!
//! The image is read exactly once and fanned out to every destination. With verification
//! enabled, each destination is read back and its SHA-256 compared against the bytes written.
//! A destination that fails is dropped from the write set and reported, the others carry on.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::fs::File;
//!
//! let dst = [PathBuf::from("/dev/sdz")];
//! let img = || {
//!     let f = File::open("/tmp/image")?;
//!     let size = f.metadata()?.len();
//!     Ok((f, size))
//! };
//! let (tx, rx) = futures::channel::mpsc::channel(20);
//!
//! let flash_thread = std::thread::spawn(move || {
//!     autokit_flasher_sd::flash(img, &dst, Some(tx), true, None)
//! });
//!
//! let msgs = futures::executor::block_on_stream(rx);
//! for m in msgs {
//!     println!("{:?}", m);
//! }
//!
//! let report = flash_thread.join().unwrap().unwrap();
//! assert!(report.is_success());
//! ```

use std::{io, path::PathBuf};

use thiserror::Error;

mod flashing;
mod helpers;
pub(crate) mod pal;

pub use flashing::flash;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for this crate
pub enum Error {
    #[error("Sha256 verification error")]
    Sha256Verification,
    #[error("IO Error: {0}")]
    IoError(io::Error),
    /// Aborted before completing
    #[error("Aborted before completing")]
    Aborted,
    #[error("Failed to open {0}")]
    FailedToOpenDestination(String),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

/// Outcome of writing one image to a set of destinations.
#[derive(Debug, Default)]
pub struct FlashReport {
    /// Bytes written to each successful destination (including alignment padding).
    pub bytes_written: u64,
    /// Destinations that failed, along with the reason.
    pub failures: Vec<(PathBuf, Error)>,
}

impl FlashReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Flashing status
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Status {
    Preparing,
    Flashing(f32),
    Verifying(f32),
}
