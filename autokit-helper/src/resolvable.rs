use std::path::Path;

/// A trait to signify flashing sources. Flashers take any file as an input that implements this
/// trait, which allows opening (and possibly decompressing) to happen lazily.
pub trait Resolvable {
    type ResolvedType;

    /// Open the source. Slow work (decompression headers, stat calls) can be done here.
    fn resolve(&self) -> impl Future<Output = std::io::Result<Self::ResolvedType>> + Send;
}

/// A plain file in the local filesystem, resolved to the file and its size in bytes.
#[derive(Debug, Clone)]
pub struct LocalFile(Box<Path>);

impl LocalFile {
    /// Construct a new local file from path.
    pub const fn new(path: Box<Path>) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Resolvable for LocalFile {
    type ResolvedType = (std::fs::File, u64);

    async fn resolve(&self) -> std::io::Result<Self::ResolvedType> {
        let f = tokio::fs::File::open(&self.0).await?.into_std().await;
        let size = size(&f.metadata()?);
        Ok((f, size))
    }
}

#[cfg(unix)]
fn size(file: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    file.size()
}

#[cfg(windows)]
fn size(file: &std::fs::Metadata) -> u64 {
    use std::os::windows::fs::MetadataExt;
    file.file_size()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{LocalFile, Resolvable};

    #[tokio::test]
    async fn local_file_size() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0xaa; 1536]).unwrap();

        let (_, size) = LocalFile::new(f.path().into()).resolve().await.unwrap();
        assert_eq!(size, 1536);
    }

    #[tokio::test]
    async fn missing_file() {
        let res = LocalFile::new(std::path::Path::new("/nonexistent/autokit.img").into())
            .resolve()
            .await;
        assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::NotFound);
    }
}
