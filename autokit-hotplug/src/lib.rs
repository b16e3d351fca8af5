//! Attach/detach notifications for storage and USB boot-mode devices.
//!
//! There is no dependency on udev. A [`Watcher`] polls a set of [`Adapter`]s, diffs consecutive
//! snapshots and turns the difference into [`Event`]s. Devices present on the first scan are
//! reported as attached.
//!
//! A Compute Module style DUT shows up three times during a boot-mode flash: first as a raw
//! [`UsbBootDrive`], then it detaches, then it attaches again as a [`BlockDevice`] described as
//! [`COMPUTE_MODULE`].

use std::path::PathBuf;

mod adapters;
mod watcher;

pub use adapters::{Adapter, BlockDeviceAdapter, COMPUTE_MODULE, UsbbootDeviceAdapter};
pub use watcher::{Event, WaitError, Watcher};

/// A device in USB boot mode, before any mass storage gadget is running.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbBootDrive {
    pub bus: u8,
    pub port: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// A block device that can be flashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub description: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    UsbBoot(UsbBootDrive),
    Block(BlockDevice),
}

impl Node {
    pub const fn as_block(&self) -> Option<&BlockDevice> {
        match self {
            Node::Block(x) => Some(x),
            Node::UsbBoot(_) => None,
        }
    }

    pub const fn is_usb_boot(&self) -> bool {
        matches!(self, Node::UsbBoot(_))
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::UsbBoot(x) => write!(
                f,
                "usbboot {:04x}:{:04x} at {}-{}",
                x.vendor_id, x.product_id, x.bus, x.port
            ),
            Node::Block(x) => write!(f, "{} ({})", x.path.display(), x.description),
        }
    }
}

/// An adapter failed to enumerate devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Device scan failed: {0}")]
pub struct ScanError(pub String);
