use std::io::Read;

use futures::channel::mpsc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::{Result, Status};

pub(crate) fn sha256_reader_progress(
    mut reader: impl Read,
    size: u64,
    mut chan: Option<&mut mpsc::Sender<Status>>,
    cancel: Option<&CancellationToken>,
) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];
    let mut pos = 0;

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }

        hasher.update(&buffer[..count]);

        pos += count;
        chan_send(chan.as_deref_mut(), Status::Verifying(progress(pos, size)));
        check_token(cancel)?;
    }

    Ok(hasher.finalize().into())
}

pub(crate) fn chan_send(chan: Option<&mut mpsc::Sender<Status>>, msg: Status) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

pub(crate) fn progress(pos: usize, img_size: u64) -> f32 {
    if img_size == 0 {
        1.0
    } else {
        (pos as f32 / img_size as f32).min(1.0)
    }
}

pub(crate) fn check_token(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(x) if x.is_cancelled() => Err(crate::Error::Aborted),
        _ => Ok(()),
    }
}

/// Make sure everything written has reached the device before it is handed back.
pub(crate) trait Eject {
    fn eject(&mut self) -> std::io::Result<()>;
}

impl Eject for std::fs::File {
    fn eject(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

#[cfg(test)]
impl Eject for std::io::Cursor<Vec<u8>> {
    fn eject(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
