#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub(crate) use linux::drive_list;

#[cfg(not(target_os = "linux"))]
pub(crate) fn drive_list() -> anyhow::Result<Vec<crate::DeviceDescriptor>> {
    anyhow::bail!("Drive listing is only supported on Linux")
}
