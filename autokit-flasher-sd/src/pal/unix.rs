use crate::{Error, Result};

use std::path::Path;

pub(crate) fn open(dst: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(false)
        .open(dst)
        .map_err(|e| Error::FailedToOpenDestination(format!("{}: {e}", dst.display())))
}
