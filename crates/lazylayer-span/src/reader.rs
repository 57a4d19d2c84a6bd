//! Positional access to the compressed layer.
//!
//! The span manager never streams a layer; it asks for the exact
//! compressed range of one span at a time, possibly from many tasks at
//! once. A registry client with retries would implement
//! [`ContentReader`] the same way [`FileReader`] does.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lazylayer_common::error::{LazyLayerError, Result};

/// Random-access reader over compressed layer bytes.
#[async_trait]
pub trait ContentReader: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    /// Zero means `offset` is at or past the end.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Transport` if the source fails.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the compressed layer.
    fn size(&self) -> u64;
}

/// Reads exactly `len` bytes at `offset`.
///
/// # Errors
///
/// Returns `LazyLayerError::Transport` if the reader fails or ends early.
pub async fn read_exact_at(reader: &dyn ContentReader, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let at = offset + filled as u64;
        let n = reader.read_at(at, &mut buf[filled..]).await?;
        if n == 0 {
            return Err(LazyLayerError::Transport {
                offset: at,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("layer ended after {filled} of {len} bytes"),
                ),
            });
        }
        filled += n;
    }
    Ok(buf)
}

/// Reader over bytes already in memory.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Bytes,
}

impl MemoryReader {
    /// Wraps `data`.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ContentReader for MemoryReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(crate::cache::copy_at(&self.data, offset, buf))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Reader over a local file. Reads run on the blocking pool.
#[derive(Debug, Clone)]
pub struct FileReader {
    file: Arc<File>,
    path: PathBuf,
    size: u64,
}

impl FileReader {
    /// Opens the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Io` if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let io_err = |e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        tracing::debug!(path = %path.display(), size, "opened layer file");
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            size,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentReader for FileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        read_shared_file_at(Arc::clone(&self.file), offset, buf)
            .await?
            .map_err(|e| LazyLayerError::Transport { offset, source: e })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Positional read of a shared file on the blocking pool.
///
/// The outer error is a failed blocking task, the inner one the read.
pub(crate) async fn read_shared_file_at(
    file: Arc<File>,
    offset: u64,
    buf: &mut [u8],
) -> Result<std::io::Result<usize>> {
    let len = buf.len();
    let read = tokio::task::spawn_blocking(move || {
        let mut chunk = vec![0u8; len];
        let n = read_file_at(&file, offset, &mut chunk)?;
        chunk.truncate(n);
        Ok::<_, std::io::Error>(chunk)
    })
    .await
    .map_err(|e| LazyLayerError::Task {
        message: e.to_string(),
    })?;
    Ok(read.map(|chunk| {
        buf[..chunk.len()].copy_from_slice(&chunk);
        chunk.len()
    }))
}

/// Positional read that leaves no shared cursor behind.
#[cfg(unix)]
fn read_file_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Positional read that leaves no shared cursor behind.
#[cfg(windows)]
fn read_file_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_reader_reads_ranges() {
        let reader = MemoryReader::new(b"0123456789".to_vec());
        assert_eq!(reader.size(), 10);
        assert_eq!(read_exact_at(&reader, 3, 4).await.expect("read"), b"3456");

        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(7, &mut buf).await.expect("tail"), 3);
        assert_eq!(reader.read_at(10, &mut buf).await.expect("end"), 0);
        assert_eq!(reader.read_at(u64::MAX, &mut buf).await.expect("far"), 0);
    }

    #[tokio::test]
    async fn read_past_end_is_transport_error() {
        let reader = MemoryReader::new(b"short".to_vec());
        assert!(matches!(
            read_exact_at(&reader, 2, 10).await,
            Err(LazyLayerError::Transport { offset: 5, .. })
        ));
    }

    #[tokio::test]
    async fn file_reader_reads_concurrently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("layer.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        std::fs::write(&path, &data).expect("write");

        let reader = FileReader::open(&path).expect("open");
        assert_eq!(reader.size(), 100_000);
        assert_eq!(reader.path(), path);

        let (a, b) = tokio::join!(
            read_exact_at(&reader, 0, 50_000),
            read_exact_at(&reader, 60_000, 40_000)
        );
        assert_eq!(a.expect("first half"), &data[..50_000]);
        assert_eq!(b.expect("tail"), &data[60_000..]);
    }

    #[test]
    fn file_reader_open_missing_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            FileReader::open(&dir.path().join("missing")),
            Err(LazyLayerError::Io { .. })
        ));
    }
}
