use std::path::PathBuf;

use autokit_drivelist::DeviceDescriptor;

use crate::{BlockDevice, Node, ScanError, UsbBootDrive};

/// Description given to a Compute Module (or anything running the same mass storage gadget)
/// once it shows up as a block device.
pub const COMPUTE_MODULE: &str = "Compute Module";

/// Vendor and model, joined, reported by the usbboot mass storage gadget depending on firmware
/// and kernel. Only USB attached drives are considered.
const COMPUTE_MODULE_NAMES: &[&str] = &[
    "0001",
    "RPi-MSD- 0001",
    "File-Stor Gadget",
    "Linux File-Stor Gadget USB Device",
    "Linux File-Stor Gadget Media",
];

const USBBOOT_VENDOR_ID: u16 = 0x0a5c;
const USBBOOT_PRODUCT_IDS: &[u16] = &[0x2763, 0x2764, 0x2711];

/// A source of devices. Scans are blocking and run off the async runtime.
pub trait Adapter: Send + Sync {
    fn scan(&self) -> Result<Vec<Node>, ScanError>;
}

/// Removable block devices, as listed by [`autokit_drivelist::drive_list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockDeviceAdapter {
    include_system_drives: bool,
}

impl BlockDeviceAdapter {
    pub const fn new(include_system_drives: bool) -> Self {
        Self {
            include_system_drives,
        }
    }
}

impl Adapter for BlockDeviceAdapter {
    fn scan(&self) -> Result<Vec<Node>, ScanError> {
        let drives = autokit_drivelist::drive_list().map_err(|e| ScanError(format!("{e:#}")))?;
        Ok(block_devices(drives, self.include_system_drives))
    }
}

fn block_devices(drives: Vec<DeviceDescriptor>, include_system_drives: bool) -> Vec<Node> {
    drives
        .into_iter()
        .filter(|x| include_system_drives || !x.is_system)
        .map(|x| {
            let description = if is_compute_module(&x) {
                COMPUTE_MODULE.to_string()
            } else {
                x.description
            };

            Node::Block(BlockDevice {
                path: PathBuf::from(x.raw),
                description,
                size: x.size,
            })
        })
        .collect()
}

/// Partition labels end up in the description, so match on what the USB device reports instead.
fn is_compute_module(x: &DeviceDescriptor) -> bool {
    let ident = [x.vendor.as_deref(), x.model.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    x.is_usb && COMPUTE_MODULE_NAMES.contains(&ident.as_str())
}

/// Raspberry Pi SoCs sitting in the ROM USB boot loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbbootDeviceAdapter;

impl Adapter for UsbbootDeviceAdapter {
    fn scan(&self) -> Result<Vec<Node>, ScanError> {
        let devices = rusb::devices().map_err(|e| ScanError(format!("usb: {e}")))?;

        Ok(devices
            .iter()
            .filter_map(|x| {
                let desc = x.device_descriptor().ok()?;
                is_usbboot(desc.vendor_id(), desc.product_id()).then(|| {
                    Node::UsbBoot(UsbBootDrive {
                        bus: x.bus_number(),
                        port: x.port_number(),
                        vendor_id: desc.vendor_id(),
                        product_id: desc.product_id(),
                    })
                })
            })
            .collect())
    }
}

fn is_usbboot(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == USBBOOT_VENDOR_ID && USBBOOT_PRODUCT_IDS.contains(&product_id)
}
