//! Image sources: raw disk images and xz or gzip compressed ones, detected by magic.

use std::{
    fs::File,
    io::{ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use autokit_helper::resolvable::{LocalFile, Resolvable};

const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct OsImage {
    size: u64,
    img: OsImageReader,
}

enum OsImageReader {
    Xz(liblzma::read::XzDecoder<File>),
    Gz(flate2::read::MultiGzDecoder<std::io::BufReader<File>>),
    Uncompressed(std::io::BufReader<File>),
}

impl OsImage {
    /// Detect the image format. `size` is the on disk size of `file`.
    ///
    /// Zip archives are refused with [`ErrorKind::Unsupported`].
    pub fn from_file(mut file: File, size: u64) -> std::io::Result<Self> {
        let mut magic = [0u8; 6];
        let n = read_magic(&mut file, &mut magic)?;
        file.seek(SeekFrom::Start(0))?;

        match magic {
            _ if n == magic.len() && magic == XZ_MAGIC => {
                let size = liblzma::uncompressed_size(&mut file)?;

                file.seek(SeekFrom::Start(0))?;
                let img = liblzma::read::XzDecoder::new_parallel(file);

                Ok(Self {
                    size,
                    img: OsImageReader::Xz(img),
                })
            }
            [0x50, 0x4b, 0x03, 0x04, ..] if n >= ZIP_MAGIC.len() => Err(std::io::Error::new(
                ErrorKind::Unsupported,
                "zip archives are not supported",
            )),
            [0x1f, 0x8b, ..] if n >= GZIP_MAGIC.len() => {
                let size = gzip_size_hint(&mut file, size)?;

                file.seek(SeekFrom::Start(0))?;
                let img = flate2::read::MultiGzDecoder::new(std::io::BufReader::new(file));

                Ok(Self {
                    size,
                    img: OsImageReader::Gz(img),
                })
            }
            _ => Ok(Self {
                size,
                img: OsImageReader::Uncompressed(std::io::BufReader::new(file)),
            }),
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Self::from_file(file, size)
    }

    /// Number of bytes that will be written to the destination.
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn is_compressed(&self) -> bool {
        !matches!(self.img, OsImageReader::Uncompressed(_))
    }
}

impl Read for OsImage {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.img {
            OsImageReader::Xz(x) => x.read(buf),
            OsImageReader::Gz(x) => x.read(buf),
            OsImageReader::Uncompressed(x) => x.read(buf),
        }
    }
}

/// The gzip trailer stores the uncompressed size modulo 2^32. Only used for progress, so an
/// image past 4 GiB just reports progress coarsely.
fn gzip_size_hint(file: &mut File, compressed: u64) -> std::io::Result<u64> {
    if compressed < 18 {
        return Ok(compressed);
    }

    let mut trailer = [0u8; 4];
    file.seek(SeekFrom::End(-4))?;
    file.read_exact(&mut trailer)?;
    Ok(u64::from(u32::from_le_bytes(trailer)))
}

/// Images shorter than the magic are treated as raw.
fn read_magic(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        match file.read(&mut buf[pos..])? {
            0 => break,
            n => pos += n,
        }
    }
    Ok(pos)
}

/// An OS image present in the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalImage(LocalFile);

impl LocalImage {
    pub const fn new(path: Box<Path>) -> Self {
        Self(LocalFile::new(path))
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Resolvable for LocalImage {
    type ResolvedType = (OsImage, u64);

    async fn resolve(&self) -> std::io::Result<Self::ResolvedType> {
        let (file, size) = self.0.resolve().await?;
        let img = tokio::task::spawn_blocking(move || OsImage::from_file(file, size))
            .await
            .map_err(std::io::Error::other)??;

        let size = img.size();
        Ok((img, size))
    }
}

impl std::fmt::Display for LocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.path().file_name() {
            Some(x) => write!(f, "{}", x.to_string_lossy()),
            None => write!(f, "{}", self.path().display()),
        }
    }
}
