use std::process::Command;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::device::{DeviceDescriptor, MountPoint};

/// Devices that are never flash targets: loop devices, optical drives and RAM disks.
const IGNORED_PREFIXES: &[&str] = &["/dev/loop", "/dev/sr", "/dev/ram", "/dev/zram"];

pub(crate) fn drive_list() -> anyhow::Result<Vec<DeviceDescriptor>> {
    let output = Command::new("lsblk")
        .args(["--bytes", "--all", "--json", "--paths", "--output-all"])
        .output()
        .context("Failed to run lsblk")?;

    if !output.status.success() {
        anyhow::bail!(
            "lsblk failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse(&output.stdout)
}

fn parse(data: &[u8]) -> anyhow::Result<Vec<DeviceDescriptor>> {
    let output: LsblkOutput = serde_json::from_slice(data).context("Invalid lsblk output")?;

    Ok(output
        .blockdevices
        .into_iter()
        .filter(|x| x.kind.as_deref().is_none_or(|k| k == "disk"))
        .filter(|x| !IGNORED_PREFIXES.iter().any(|p| x.name.starts_with(p)))
        .map(descriptor)
        .collect())
}

fn descriptor(dev: LsblkDevice) -> DeviceDescriptor {
    let subsystems = dev.subsystems.clone().unwrap_or_default();
    let is_virtual = subsystems.is_empty() || subsystems.eq_ignore_ascii_case("block");
    let is_removable = dev.rm || dev.hotplug || is_virtual;

    let label = dev
        .label
        .as_deref()
        .or_else(|| dev.children.iter().find_map(|c| c.label.as_deref()));
    let vendor = trimmed(dev.vendor.as_deref());
    let model = trimmed(dev.model.as_deref());
    let description = [trimmed(label), vendor.clone(), model.clone()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    let mountpoints = std::iter::once(&dev)
        .chain(dev.children.iter())
        .flat_map(|x| x.mountpoints())
        .collect();

    DeviceDescriptor {
        enumerator: "lsblk:json".to_string(),
        bus_type: Some(dev.tran.as_deref().unwrap_or("unknown").to_uppercase()),
        device: dev.name.clone(),
        raw: dev.name.clone(),
        description,
        vendor,
        model,
        partition_table_type: dev.pttype.clone(),
        size: dev.size,
        block_size: if dev.phy_sec == 0 { 512 } else { dev.phy_sec as u32 },
        logical_block_size: if dev.log_sec == 0 { 512 } else { dev.log_sec as u32 },
        mountpoints,
        is_read_only: dev.ro,
        is_system: !is_removable && !is_virtual,
        is_card: subsystems.contains("mmc"),
        is_scsi: subsystems.contains("sd") || subsystems.contains("scsi"),
        is_usb: subsystems.contains("usb"),
        is_virtual,
        is_removable,
    }
}

fn trimmed(x: Option<&str>) -> Option<String> {
    x.map(str::trim).filter(|x| !x.is_empty()).map(String::from)
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize, Default, Clone)]
#[serde(default)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    tran: Option<String>,
    subsystems: Option<String>,
    #[serde(deserialize_with = "flex_bool")]
    rm: bool,
    #[serde(deserialize_with = "flex_bool")]
    ro: bool,
    #[serde(deserialize_with = "flex_bool")]
    hotplug: bool,
    #[serde(deserialize_with = "flex_u64")]
    size: u64,
    label: Option<String>,
    vendor: Option<String>,
    model: Option<String>,
    pttype: Option<String>,
    mountpoint: Option<String>,
    mountpoints: Option<Vec<Option<String>>>,
    #[serde(rename = "phy-sec", deserialize_with = "flex_u64")]
    phy_sec: u64,
    #[serde(rename = "log-sec", deserialize_with = "flex_u64")]
    log_sec: u64,
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn mountpoints(&self) -> Vec<MountPoint> {
        // Older lsblk only has `mountpoint`, newer ones have both.
        let mut res: Vec<MountPoint> = self
            .mountpoints
            .iter()
            .flatten()
            .flatten()
            .map(|p| MountPoint {
                path: p.clone(),
                label: self.label.clone(),
            })
            .collect();

        if res.is_empty() {
            if let Some(p) = &self.mountpoint {
                res.push(MountPoint {
                    path: p.clone(),
                    label: self.label.clone(),
                });
            }
        }

        res
    }
}

/// lsblk changed the representation of a few columns between versions.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flex {
    Bool(bool),
    Num(u64),
    Str(String),
}

fn flex_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Option::<Flex>::deserialize(d)? {
        Some(Flex::Bool(x)) => x,
        Some(Flex::Num(x)) => x != 0,
        Some(Flex::Str(x)) => x.trim() == "1",
        None => false,
    })
}

fn flex_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    Ok(match Option::<Flex>::deserialize(d)? {
        Some(Flex::Num(x)) => x,
        Some(Flex::Str(x)) => x.trim().parse().unwrap_or_default(),
        Some(Flex::Bool(_)) | None => 0,
    })
}
