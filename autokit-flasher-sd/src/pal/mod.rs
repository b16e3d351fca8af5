#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::open;

#[cfg(not(unix))]
pub(crate) fn open(dst: &std::path::Path) -> crate::Result<std::fs::File> {
    Err(crate::Error::FailedToOpenDestination(format!(
        "{}: unsupported platform",
        dst.display()
    )))
}
