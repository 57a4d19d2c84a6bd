//! JSON companion of a span index artifact.
//!
//! The manifest records the stream sizes the index was built against and
//! one SHA-256 digest per span, taken over the span's compressed byte range.
//! Span managers verify fetched bytes against these digests.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use lazylayer_common::constants::MANIFEST_EXTENSION;
use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::types::{Sha256Hash, SpanId};
use serde::{Deserialize, Serialize};

use crate::index::{SpanIndex, StreamSizes};

/// Sizes and per-span digests of one indexed layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerManifest {
    /// Size of the compressed layer in bytes.
    pub compressed_size: u64,
    /// Size of the decompressed layer in bytes.
    pub uncompressed_size: u64,
    /// Span size the index was built with.
    pub span_size: u64,
    /// Number of spans.
    pub span_count: usize,
    /// Digest of each span's compressed bytes, in span order.
    pub span_digests: Vec<Sha256Hash>,
}

impl LayerManifest {
    /// Hashes every span of `index` by reading its compressed range from
    /// `reader`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Transport` if a span range cannot be read.
    pub fn compute<I, R>(index: &I, sizes: StreamSizes, reader: &mut R) -> Result<Self>
    where
        I: SpanIndex + ?Sized,
        R: Read + Seek,
    {
        let mut span_digests = Vec::with_capacity(index.span_count());
        let mut buf = Vec::new();
        for i in 0..index.span_count() {
            let span = SpanId::new(u32::try_from(i).map_err(|_| {
                LazyLayerError::format("index has more spans than span ids")
            })?);
            let start = index.start_compressed_offset(span)?;
            let end = index.end_compressed_offset(span, sizes.compressed)?;
            let len = usize::try_from(end.saturating_sub(start))
                .map_err(|_| LazyLayerError::format("span too large for memory"))?;
            buf.resize(len, 0);
            let _ = reader
                .seek(SeekFrom::Start(start))
                .map_err(|e| LazyLayerError::Transport {
                    offset: start,
                    source: e,
                })?;
            reader
                .read_exact(&mut buf)
                .map_err(|e| LazyLayerError::Transport {
                    offset: start,
                    source: e,
                })?;
            span_digests.push(Sha256Hash::digest(&buf));
        }
        tracing::debug!(spans = span_digests.len(), "computed span digests");
        Ok(Self {
            compressed_size: sizes.compressed,
            uncompressed_size: sizes.uncompressed,
            span_size: index.span_size(),
            span_count: span_digests.len(),
            span_digests,
        })
    }

    /// Expected digest of `span`.
    #[must_use]
    pub fn digest(&self, span: SpanId) -> Option<&Sha256Hash> {
        self.span_digests.get(span.index())
    }

    /// Stream sizes recorded in the manifest.
    #[must_use]
    pub const fn sizes(&self) -> StreamSizes {
        StreamSizes {
            compressed: self.compressed_size,
            uncompressed: self.uncompressed_size,
        }
    }

    /// Checks that the manifest describes `index`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Format` if span count, span size or the
    /// number of digests disagree.
    pub fn validate_against<I: SpanIndex + ?Sized>(&self, index: &I) -> Result<()> {
        if self.span_digests.len() != self.span_count {
            return Err(LazyLayerError::format(format!(
                "manifest lists {} digests for {} spans",
                self.span_digests.len(),
                self.span_count
            )));
        }
        if self.span_count != index.span_count() || self.span_size != index.span_size() {
            return Err(LazyLayerError::format(format!(
                "manifest describes {} spans of {} bytes, index has {} spans of {} bytes",
                self.span_count,
                self.span_size,
                index.span_count(),
                index.span_size()
            )));
        }
        Ok(())
    }

    /// Writes the manifest as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Reads a manifest written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let manifest: Self = serde_json::from_str(&content)?;
        Ok(manifest)
    }
}

/// Path of the manifest stored next to the index artifact `index_path`.
///
/// `layer.zinfo` becomes `layer.zinfo.json`.
#[must_use]
pub fn manifest_path(index_path: &Path) -> PathBuf {
    let mut name = index_path.file_stem().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(MANIFEST_EXTENSION);
    index_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use flate2::Compression;

    use super::*;
    use crate::index::GzipIndex;
    use crate::index::tests::{gzip, sample};

    fn indexed() -> (Vec<u8>, GzipIndex, LayerManifest) {
        let gz = gzip(&sample(300_000, 5), Compression::fast());
        let (index, sizes) = GzipIndex::build(&gz[..], 64 * 1024).expect("build");
        let manifest =
            LayerManifest::compute(&index, sizes, &mut Cursor::new(&gz)).expect("manifest");
        (gz, index, manifest)
    }

    #[test]
    fn compute_hashes_each_compressed_range() {
        let (gz, index, manifest) = indexed();
        assert_eq!(manifest.span_count, index.span_count());
        assert_eq!(manifest.compressed_size, gz.len() as u64);
        assert_eq!(manifest.uncompressed_size, 300_000);
        for checkpoint in index.checkpoints() {
            let span = checkpoint.span();
            let start = index.start_compressed_offset(span).expect("start");
            let end = index
                .end_compressed_offset(span, gz.len() as u64)
                .expect("end");
            let expected = Sha256Hash::digest(&gz[start as usize..end as usize]);
            assert_eq!(manifest.digest(span), Some(&expected));
        }
        let past = SpanId::new(u32::try_from(index.span_count()).expect("count"));
        assert!(manifest.digest(past).is_none());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("layer.zinfo.json");
        let (_, _, manifest) = indexed();
        manifest.save(&path).expect("save");
        let loaded = LayerManifest::load(&path).expect("load");
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn validate_against_detects_other_index() {
        let (_, index, manifest) = indexed();
        manifest.validate_against(&index).expect("matching index");

        let other = gzip(&sample(10_000, 9), Compression::fast());
        let (small, _) = GzipIndex::build(&other[..], 64 * 1024).expect("build");
        assert!(matches!(
            manifest.validate_against(&small),
            Err(LazyLayerError::Format { .. })
        ));
    }

    #[test]
    fn load_rejects_invalid_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.zinfo.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            LayerManifest::load(&path),
            Err(LazyLayerError::Serialization { .. })
        ));
    }

    #[test]
    fn manifest_path_sits_next_to_index() {
        assert_eq!(
            manifest_path(Path::new("/var/layers/base.zinfo")),
            PathBuf::from("/var/layers/base.zinfo.json")
        );
    }
}
