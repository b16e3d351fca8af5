//! Enumerate block devices attached to the tester host. Inspired by [Balena's drivelist].
//!
//! Only Linux is supported, since that is the only OS the tester host runs. Other platforms
//! return an error from [`drive_list`].
//!
//! [Balena's drivelist]: https://github.com/balena-io-modules/drivelist

mod device;

mod pal;

pub use device::{DeviceDescriptor, MountPoint};

/// Get a list of all drives
pub fn drive_list() -> anyhow::Result<Vec<DeviceDescriptor>> {
    pal::drive_list()
}
