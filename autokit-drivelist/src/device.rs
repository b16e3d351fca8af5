use serde::Serialize;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub path: String,
    pub label: Option<String>,
}

impl MountPoint {
    pub fn new(path: impl ToString) -> Self {
        Self {
            path: path.to_string(),
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub enumerator: String,
    pub bus_type: Option<String>,
    pub device: String,
    /// Path that should be opened for raw access
    pub raw: String,
    pub description: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub partition_table_type: Option<String>,
    pub size: u64,
    pub block_size: u32,
    pub logical_block_size: u32,
    pub mountpoints: Vec<MountPoint>,
    /// Device is read-only
    pub is_read_only: bool,
    /// Device is a system drive
    pub is_system: bool,
    /// Device is an SD-card
    pub is_card: bool,
    /// Connected via the Small Computer System Interface (SCSI)
    pub is_scsi: bool,
    /// Connected via Universal Serial Bus (USB)
    pub is_usb: bool,
    /// Device is a virtual storage device
    pub is_virtual: bool,
    /// Device is removable from the running system
    pub is_removable: bool,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            block_size: 512,
            logical_block_size: 512,
            enumerator: Default::default(),
            bus_type: Default::default(),
            device: Default::default(),
            raw: Default::default(),
            description: Default::default(),
            vendor: Default::default(),
            model: Default::default(),
            partition_table_type: Default::default(),
            size: Default::default(),
            mountpoints: Default::default(),
            is_read_only: Default::default(),
            is_system: Default::default(),
            is_card: Default::default(),
            is_scsi: Default::default(),
            is_usb: Default::default(),
            is_virtual: Default::default(),
            is_removable: Default::default(),
        }
    }
}
