use std::{io::Read, path::PathBuf};

use autokit_helper::resolvable::Resolvable;
use futures::channel::mpsc;

use crate::{Error, Result, testbot::FlashJob};

pub use autokit_flasher_sd::Status;

/// Write `img` to `dst` and read it back. Runs the blocking write on the blocking pool; the job
/// token is checked between chunks and the writer holds a lease on the job until it returns.
pub(crate) async fn write_image<I, R>(
    img: &I,
    dst: PathBuf,
    chan: Option<mpsc::Sender<Status>>,
    job: &FlashJob,
) -> Result<()>
where
    I: Resolvable<ResolvedType = (R, u64)> + Sync,
    R: Read + Send + 'static,
{
    let cancel = job.token().clone();
    if cancel.is_cancelled() {
        return Err(Error::Aborted);
    }

    let (reader, size) = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Aborted),
        res = img.resolve() => res.map_err(image_error)?,
    };
    tracing::info!("Writing {size} bytes to {}", dst.display());

    let lease = job.lease();
    let report = tokio::task::spawn_blocking(move || {
        let _lease = lease;
        autokit_flasher_sd::flash(move || Ok((reader, size)), &[dst], chan, true, Some(cancel))
    })
    .await
    .map_err(std::io::Error::other)?;

    let report = match report {
        Ok(x) => x,
        Err(autokit_flasher_sd::Error::Aborted) => return Err(Error::Aborted),
        Err(e) => {
            tracing::error!("Failure during flashing: {e}");
            return Err(Error::Flash(e.to_string()));
        }
    };

    if report.is_success() {
        tracing::info!("Flashed {} bytes", report.bytes_written);
        return Ok(());
    }

    let msgs: Vec<String> = report
        .failures
        .iter()
        .map(|(p, e)| format!("{}: {e}", p.display()))
        .collect();
    for m in &msgs {
        tracing::error!("Failure during flashing: {m}");
    }

    Err(Error::Flash(msgs.join("\n")))
}

fn image_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::Unsupported => Error::UnsupportedImage(e.to_string()),
        _ => Error::Io(e),
    }
}
