//! Blob cache seam for span bytes.
//!
//! Span managers store compressed and decompressed span bytes under the
//! span id. Writes are staged and only become visible on commit; dropping
//! an uncommitted writer aborts it. Implementations that touch the disk
//! do so on the blocking pool.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lazylayer_common::error::{LazyLayerError, Result};
use tempfile::NamedTempFile;

/// Key/value store for span bytes.
#[async_trait]
pub trait BlobCache: Send + Sync {
    /// Starts writing the blob stored under `key`, replacing any previous
    /// value once committed.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Closed` after [`close`](Self::close).
    fn add(&self, key: &str) -> Result<Box<dyn CacheWriter>>;

    /// Opens the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Cache` if the key is missing and
    /// `LazyLayerError::Closed` after [`close`](Self::close).
    async fn get(&self, key: &str) -> Result<Box<dyn CacheReader>>;

    /// Releases the cache. Later calls fail with `Closed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be released.
    fn close(&self) -> Result<()>;
}

/// Staged blob write.
#[async_trait]
pub trait CacheWriter: Send {
    /// Appends bytes to the staged blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be staged.
    fn write(&mut self, data: Bytes) -> Result<()>;

    /// Publishes the staged blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be published.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Positional reader over a committed blob.
#[async_trait]
pub trait CacheReader: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Cache` if the blob cannot be read.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Size of the blob in bytes.
    fn size(&self) -> u64;
}

/// Writes `data` under `key` in one step.
///
/// # Errors
///
/// Returns any error of the writer.
pub async fn put(cache: &dyn BlobCache, key: &str, data: Bytes) -> Result<()> {
    let mut writer = cache.add(key)?;
    writer.write(data)?;
    writer.commit().await
}

/// Reads `len` bytes at `offset` from the blob under `key`.
///
/// # Errors
///
/// Returns `LazyLayerError::Cache` if the blob is missing or shorter than
/// requested.
pub async fn read_range(
    cache: &dyn BlobCache,
    key: &str,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let reader = cache.get(key).await?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader
            .read_at(offset + filled as u64, &mut buf[filled..])
            .await?;
        if n == 0 {
            return Err(LazyLayerError::Cache {
                key: key.to_owned(),
                message: format!(
                    "blob holds {} bytes, {len} requested at offset {offset}",
                    reader.size()
                ),
            });
        }
        filled += n;
    }
    Ok(buf)
}

fn missing(key: &str) -> LazyLayerError {
    LazyLayerError::Cache {
        key: key.to_owned(),
        message: "not found".into(),
    }
}

type Entries = Arc<RwLock<HashMap<String, Bytes>>>;

/// In-process cache backed by a hash map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Entries,
    closed: AtomicBool,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |e| e.len())
    }

    /// Returns `true` if no blob is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LazyLayerError::Closed {
                resource: "blob cache",
            });
        }
        Ok(())
    }
}

fn poisoned(key: &str) -> LazyLayerError {
    LazyLayerError::Cache {
        key: key.to_owned(),
        message: "cache lock poisoned".into(),
    }
}

#[async_trait]
impl BlobCache for MemoryCache {
    fn add(&self, key: &str) -> Result<Box<dyn CacheWriter>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryWriter {
            entries: Arc::clone(&self.entries),
            key: key.to_owned(),
            chunks: Vec::new(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Box<dyn CacheReader>> {
        self.ensure_open()?;
        let entries = self.entries.read().map_err(|_| poisoned(key))?;
        let data = entries.get(key).cloned().ok_or_else(|| missing(key))?;
        Ok(Box::new(MemoryBlob(data)))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Ok(mut entries) = self.entries.write() {
                entries.clear();
            }
        }
        Ok(())
    }
}

struct MemoryWriter {
    entries: Entries,
    key: String,
    chunks: Vec<Bytes>,
}

#[async_trait]
impl CacheWriter for MemoryWriter {
    fn write(&mut self, data: Bytes) -> Result<()> {
        self.chunks.push(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            entries,
            key,
            chunks,
        } = *self;
        let blob = concat(chunks);
        let mut entries = entries.write().map_err(|_| poisoned(&key))?;
        let _ = entries.insert(key, blob);
        Ok(())
    }
}

/// Joins staged chunks, without copying a single chunk.
fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }
    let mut blob = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        blob.extend_from_slice(&chunk);
    }
    blob.freeze()
}

struct MemoryBlob(Bytes);

#[async_trait]
impl CacheReader for MemoryBlob {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(copy_at(&self.0, offset, buf))
    }

    fn size(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Copies from `data[offset..]` into `buf`, returning the count copied.
pub(crate) fn copy_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    let Some(src) = data.get(start..) else {
        return 0;
    };
    let n = src.len().min(buf.len());
    buf[..n].copy_from_slice(&src[..n]);
    n
}

/// Cache storing one file per key in a directory.
///
/// Blobs are written to a temporary file in the same directory and renamed
/// into place on commit, so readers never observe a partial blob.
#[derive(Debug)]
pub struct DirectoryCache {
    root: PathBuf,
    closed: AtomicBool,
}

impl DirectoryCache {
    /// Opens or creates a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| LazyLayerError::Io {
            path: root.clone(),
            source: e,
        })?;
        tracing::info!(path = %root.display(), "opened directory cache");
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(LazyLayerError::Cache {
                key: key.to_owned(),
                message: "key is not a plain file name".into(),
            });
        }
        Ok(self.root.join(key))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LazyLayerError::Closed {
                resource: "blob cache",
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobCache for DirectoryCache {
    fn add(&self, key: &str) -> Result<Box<dyn CacheWriter>> {
        self.ensure_open()?;
        let target = self.blob_path(key)?;
        Ok(Box::new(FileWriter {
            root: self.root.clone(),
            target,
            chunks: Vec::new(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Box<dyn CacheReader>> {
        self.ensure_open()?;
        let path = self.blob_path(key)?;
        let opening = path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let file = File::open(&opening)?;
            let size = file.metadata()?.len();
            Ok::<_, std::io::Error>((file, size))
        })
        .await
        .map_err(|e| LazyLayerError::Task {
            message: e.to_string(),
        })?;
        let (file, size) = match opened {
            Ok(opened) => opened,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing(key)),
            Err(e) => return Err(LazyLayerError::Io { path, source: e }),
        };
        Ok(Box::new(FileBlob {
            file: Arc::new(file),
            size,
            key: key.to_owned(),
        }))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(path = %self.root.display(), "closed directory cache");
        }
        Ok(())
    }
}

/// Stages chunks in memory; commit writes a temporary file in the cache
/// directory and renames it over the target.
struct FileWriter {
    root: PathBuf,
    target: PathBuf,
    chunks: Vec<Bytes>,
}

#[async_trait]
impl CacheWriter for FileWriter {
    fn write(&mut self, data: Bytes) -> Result<()> {
        self.chunks.push(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            root,
            target,
            chunks,
        } = *self;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = NamedTempFile::new_in(&root).map_err(|e| LazyLayerError::Io {
                path: root.clone(),
                source: e,
            })?;
            for chunk in &chunks {
                file.write_all(chunk).map_err(|e| LazyLayerError::Io {
                    path: file.path().to_path_buf(),
                    source: e,
                })?;
            }
            let _ = file.persist(&target).map_err(|e| LazyLayerError::Io {
                path: target.clone(),
                source: e.error,
            })?;
            Ok(())
        })
        .await
        .map_err(|e| LazyLayerError::Task {
            message: e.to_string(),
        })?
    }
}

struct FileBlob {
    file: Arc<File>,
    size: u64,
    key: String,
}

#[async_trait]
impl CacheReader for FileBlob {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        crate::reader::read_shared_file_at(Arc::clone(&self.file), offset, buf)
            .await?
            .map_err(|e| LazyLayerError::Cache {
                key: self.key.clone(),
                message: e.to_string(),
            })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(cache: &dyn BlobCache) {
        put(cache, "0", Bytes::from_static(b"compressed bytes"))
            .await
            .expect("put");
        assert_eq!(
            read_range(cache, "0", 0, 10).await.expect("read"),
            b"compressed".to_vec()
        );

        // Replacing a key is visible only after commit.
        let mut writer = cache.add("0").expect("add");
        writer
            .write(Bytes::from_static(b"decompressed "))
            .expect("write");
        writer.write(Bytes::from_static(b"bytes")).expect("write");
        assert_eq!(cache.get("0").await.expect("get").size(), 16);
        writer.commit().await.expect("commit");
        let reader = cache.get("0").await.expect("get");
        assert_eq!(reader.size(), 18);
        assert_eq!(
            read_range(cache, "0", 13, 5).await.expect("read"),
            b"bytes".to_vec()
        );
    }

    #[tokio::test]
    async fn memory_cache_add_and_get() {
        let cache = MemoryCache::new();
        exercise(&cache).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn directory_cache_add_and_get() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DirectoryCache::open(dir.path().join("spans")).expect("open");
        exercise(&cache).await;
        assert!(cache.root().join("0").is_file());
    }

    #[tokio::test]
    async fn directory_cache_serves_concurrent_spans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DirectoryCache::open(dir.path()).expect("open");
        let blobs: Vec<Bytes> = (0..8u8).map(|i| Bytes::from(vec![i; 256 * 1024])).collect();

        let keys: Vec<String> = (0..blobs.len()).map(|i| i.to_string()).collect();

        let writes = keys
            .iter()
            .zip(&blobs)
            .map(|(key, blob)| put(&cache, key, blob.clone()));
        let _ = futures::future::try_join_all(writes).await.expect("puts");

        for (key, blob) in keys.iter().zip(&blobs) {
            let read = read_range(&cache, key, 0, blob.len())
                .await
                .expect("read");
            assert_eq!(read, blob.as_ref());
        }
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 8);
    }

    #[tokio::test]
    async fn aborted_write_is_not_visible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let disk = DirectoryCache::open(dir.path()).expect("open");
        let memory = MemoryCache::new();
        let caches: [&dyn BlobCache; 2] = [&disk, &memory];
        for cache in caches {
            let mut writer = cache.add("7").expect("add");
            writer.write(Bytes::from_static(b"partial")).expect("write");
            drop(writer);
            assert!(matches!(
                cache.get("7").await,
                Err(LazyLayerError::Cache { .. })
            ));
        }
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[tokio::test]
    async fn short_blob_read_fails() {
        let cache = MemoryCache::new();
        put(&cache, "1", Bytes::from_static(b"abc"))
            .await
            .expect("put");
        assert!(read_range(&cache, "1", 2, 4).await.is_err());
        assert_eq!(
            read_range(&cache, "1", 3, 0).await.expect("empty"),
            Vec::<u8>::new()
        );
    }

    #[tokio::test]
    async fn closed_cache_rejects_calls() {
        let cache = MemoryCache::new();
        put(&cache, "1", Bytes::from_static(b"abc"))
            .await
            .expect("put");
        cache.close().expect("close");
        cache.close().expect("close twice");
        assert!(cache.is_empty());
        assert!(matches!(
            cache.get("1").await,
            Err(LazyLayerError::Closed { .. })
        ));
        assert!(matches!(cache.add("2"), Err(LazyLayerError::Closed { .. })));
    }

    #[tokio::test]
    async fn directory_cache_rejects_path_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DirectoryCache::open(dir.path()).expect("open");
        assert!(cache.add("../escape").is_err());
        assert!(cache.get("").await.is_err());
    }
}
