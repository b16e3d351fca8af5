use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::helpers::{Eject, chan_send, check_token, progress, sha256_reader_progress};
use crate::{Error, FlashReport, Result, Status};

const BUFFER_SIZE: usize = 1024 * 1024;

/// A lot of reads from compressed files are not aligned. Since reading even from compressed files
/// is significantly faster than writing to SD Card, better to do multiple reads.
fn read_aligned(mut img: impl Read, buf: &mut [u8]) -> Result<usize> {
    const ALIGNMENT: usize = 512;

    let mut pos = 0;

    while pos != buf.len() {
        let count = img.read(&mut buf[pos..])?;
        if count == 0 {
            if pos % ALIGNMENT != 0 {
                let end = pos - pos % ALIGNMENT + ALIGNMENT;
                buf[pos..end].fill(0);
                pos = end;
            }
            return Ok(pos);
        }
        pos += count;
    }

    Ok(pos)
}

/// One destination of a multi-destination write.
struct Target<D> {
    path: PathBuf,
    dev: D,
    error: Option<Error>,
}

impl<D> Target<D> {
    const fn new(path: PathBuf, dev: D) -> Self {
        Self {
            path,
            dev,
            error: None,
        }
    }

    const fn alive(&self) -> bool {
        self.error.is_none()
    }
}

/// Stream the image into every live target. Returns the number of bytes written and the SHA-256
/// of those bytes.
///
/// Source errors and cancellation abort the whole write. Destination errors only take that
/// destination out of the set.
fn write_targets<D: Write>(
    mut img: impl Read,
    img_size: u64,
    targets: &mut [Target<D>],
    mut chan: Option<&mut mpsc::Sender<Status>>,
    cancel: Option<&CancellationToken>,
) -> Result<(u64, [u8; 32])> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut hasher = Sha256::new();
    let mut pos = 0;
    let global_start = Instant::now();
    let mut reading_time = Duration::from_secs(0);
    let mut writing_time = Duration::from_secs(0);

    chan_send(chan.as_deref_mut(), Status::Flashing(0.0));
    loop {
        let read_start = Instant::now();
        let count = read_aligned(&mut img, &mut buf)?;
        reading_time += read_start.elapsed();
        if count == 0 {
            break;
        }

        hasher.update(&buf[..count]);

        let write_start = Instant::now();
        for t in targets.iter_mut().filter(|t| t.alive()) {
            if let Err(e) = t.dev.write_all(&buf[..count]) {
                tracing::warn!("Failure during flashing {}: {e}", t.path.display());
                t.error = Some(e.into());
            }
        }
        writing_time += write_start.elapsed();

        if !targets.iter().any(Target::alive) {
            break;
        }

        pos += count;
        chan_send(chan.as_deref_mut(), Status::Flashing(progress(pos, img_size)));
        check_token(cancel)?;
    }

    for t in targets.iter_mut().filter(|t| t.alive()) {
        if let Err(e) = t.dev.flush() {
            t.error = Some(e.into());
        }
    }

    tracing::info!("Total Time taken: {:?}", global_start.elapsed());
    tracing::info!("Reading Time: {:?}", reading_time);
    tracing::info!("Writing Time: {:?}", writing_time);

    Ok((pos as u64, hasher.finalize().into()))
}

fn verify_target<D: Read + Seek>(
    dev: &mut D,
    len: u64,
    expected: &[u8; 32],
    chan: Option<&mut mpsc::Sender<Status>>,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    dev.seek(SeekFrom::Start(0))?;
    let hash = sha256_reader_progress(dev.take(len), len, chan, cancel)?;

    if &hash == expected {
        Ok(())
    } else {
        Err(Error::Sha256Verification)
    }
}

/// Flash OS image to one or more block devices.
///
/// # Image
///
/// Using a resolver function for image and image size. This allows lazy opening (and
/// decompression) only after every destination has been opened successfully.
///
/// # Failures
///
/// Failing to open or write a destination is recorded in [`FlashReport::failures`] and does not
/// stop the other destinations. Failing to read the image, or cancellation, aborts everything
/// with an error: partially written media should never be considered usable.
///
/// # Progress
///
/// Progress lies between 0 and 1.
///
/// # Aborting
///
/// The process can be aborted by cancelling `cancel`. Cancellation is observed between chunks.
pub fn flash<R: Read>(
    img_resolver: impl FnOnce() -> std::io::Result<(R, u64)>,
    dsts: &[PathBuf],
    chan: Option<mpsc::Sender<Status>>,
    verify: bool,
    cancel: Option<CancellationToken>,
) -> Result<FlashReport> {
    let mut failures = Vec::new();
    let mut targets = Vec::with_capacity(dsts.len());

    for p in dsts {
        match crate::pal::open(p) {
            Ok(f) => targets.push(Target::new(p.clone(), f)),
            Err(e) => failures.push((p.clone(), e)),
        }
    }

    if targets.is_empty() {
        return Ok(FlashReport {
            bytes_written: 0,
            failures,
        });
    }

    let (img, img_size) = img_resolver()?;
    let mut report = flash_internal(img, img_size, targets, chan, verify, cancel)?;

    failures.append(&mut report.failures);
    report.failures = failures;

    Ok(report)
}

fn flash_internal<D: Read + Write + Seek + Eject>(
    img: impl Read,
    img_size: u64,
    mut targets: Vec<Target<D>>,
    mut chan: Option<mpsc::Sender<Status>>,
    verify: bool,
    cancel: Option<CancellationToken>,
) -> Result<FlashReport> {
    chan_send(chan.as_mut(), Status::Preparing);

    let (written, hash) = write_targets(img, img_size, &mut targets, chan.as_mut(), cancel.as_ref())?;

    check_token(cancel.as_ref())?;

    if verify {
        for t in targets.iter_mut().filter(|t| t.alive()) {
            tracing::info!("Verifying {}", t.path.display());
            match verify_target(&mut t.dev, written, &hash, chan.as_mut(), cancel.as_ref()) {
                Ok(()) => {}
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => t.error = Some(e),
            }
        }
    }

    let mut failures = Vec::new();
    for mut t in targets {
        match t.error.take() {
            Some(e) => failures.push((t.path, e)),
            None => {
                if let Err(e) = t.dev.eject() {
                    failures.push((t.path, e.into()));
                }
            }
        }
    }

    Ok(FlashReport {
        bytes_written: written,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};
    use std::path::PathBuf;

    use tokio_util::sync::CancellationToken;

    use super::{Target, flash_internal, read_aligned};
    use crate::helpers::Eject;
    use crate::{Error, Status};

    fn test_file(len: usize) -> Cursor<Box<[u8]>> {
        let data: Vec<u8> = (0..len)
            .map(|x| x % 255)
            .map(|x| u8::try_from(x).unwrap())
            .collect();
        Cursor::new(data.into())
    }

    fn target(name: &str) -> Target<Cursor<Vec<u8>>> {
        Target::new(PathBuf::from(name), Cursor::new(Vec::new()))
    }

    #[test]
    fn sd_write_and_verify() {
        const FILE_LEN: usize = 12 * 1024;

        let dummy_file = test_file(FILE_LEN);

        let report = flash_internal(
            dummy_file,
            FILE_LEN as u64,
            vec![target("/dev/sdz")],
            None,
            true,
            None,
        )
        .unwrap();

        assert!(report.is_success());
        assert_eq!(report.bytes_written, FILE_LEN as u64);
    }

    #[test]
    fn unaligned_tail_is_padded() {
        let img = test_file(1000);

        let report = flash_internal(img, 1000, vec![target("/dev/sdz")], None, true, None).unwrap();

        assert!(report.is_success());
        assert_eq!(report.bytes_written, 1024);
    }

    /// Device whose contents change behind our back, so read-back never matches.
    #[derive(Debug, Default)]
    struct Corrupting(Cursor<Vec<u8>>);

    impl Read for Corrupting {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let count = self.0.read(buf)?;
            buf[..count].iter_mut().for_each(|x| *x = !*x);
            Ok(count)
        }
    }

    impl Write for Corrupting {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Corrupting {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.0.seek(pos)
        }
    }

    impl Eject for Corrupting {
        fn eject(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn verification_failure_is_reported() {
        let img = test_file(4096);
        let targets = vec![Target::new(PathBuf::from("/dev/sdy"), Corrupting::default())];

        let report = flash_internal(img, 4096, targets, None, true, None).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, PathBuf::from("/dev/sdy"));
        assert!(matches!(report.failures[0].1, Error::Sha256Verification));
    }

    #[test]
    fn no_verify_skips_readback() {
        let img = test_file(4096);
        let targets = vec![Target::new(PathBuf::from("/dev/sdy"), Corrupting::default())];

        let report = flash_internal(img, 4096, targets, None, false, None).unwrap();

        assert!(report.is_success());
    }

    #[test]
    fn cancelled_write_aborts() {
        let img = test_file(4096);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = flash_internal(img, 4096, vec![target("/dev/sdz")], None, true, Some(cancel));

        assert!(matches!(res, Err(Error::Aborted)));
    }

    #[test]
    fn progress_reported() {
        let img = test_file(4096);
        let (tx, rx) = futures::channel::mpsc::channel(20);

        flash_internal(img, 4096, vec![target("/dev/sdz")], Some(tx), true, None).unwrap();

        let msgs: Vec<Status> = futures::executor::block_on_stream(rx).collect();
        assert_eq!(msgs.first(), Some(&Status::Preparing));
        assert!(msgs.contains(&Status::Flashing(1.0)));
        assert_eq!(msgs.last(), Some(&Status::Verifying(1.0)));
    }

    #[test]
    fn flash_to_files() {
        let dst = tempfile::NamedTempFile::new().unwrap();
        let missing = PathBuf::from("/nonexistent/autokit/sdz");

        let report = super::flash(
            || Ok((test_file(2048), 2048)),
            &[dst.path().to_path_buf(), missing.clone()],
            None,
            true,
            None,
        )
        .unwrap();

        assert_eq!(report.bytes_written, 2048);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, missing);
        assert!(matches!(
            report.failures[0].1,
            Error::FailedToOpenDestination(_)
        ));
        assert_eq!(
            std::fs::read(dst.path()).unwrap(),
            test_file(2048).into_inner().to_vec()
        );
    }

    struct UnalignedReader(Cursor<Box<[u8]>>);

    impl UnalignedReader {
        const fn as_slice(&self) -> &[u8] {
            self.0.get_ref()
        }
    }

    impl Read for UnalignedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let count = std::cmp::min(self.0.get_ref().len() - self.0.position() as usize, 3);
            let count = std::cmp::min(count, buf.len());
            self.0.read(&mut buf[..count])
        }
    }

    #[test]
    fn aligned_read() {
        const FILE_LEN: usize = 12 * 1024;

        let mut dummy_file = UnalignedReader(test_file(FILE_LEN));
        let mut buf = [0u8; 1024];
        let mut pos = 0;

        loop {
            let count = read_aligned(&mut dummy_file, &mut buf).unwrap();
            if count == 0 {
                break;
            }

            assert_eq!(count % 512, 0);
            assert_eq!(buf[..count], dummy_file.as_slice()[pos..(pos + count)]);
            pos += count;
        }

        assert_eq!(pos, FILE_LEN);
    }
}
