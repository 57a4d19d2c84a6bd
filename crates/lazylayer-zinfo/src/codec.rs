//! Binary form of a [`GzipIndex`], persisted next to the layer.
//!
//! ```text
//! header:  checkpoint_count u32 | span_size u64
//! record:  span_id u32 | compressed_offset u64 | uncompressed_offset u64 | bits u8 | window [u8; 32768]
//! ```
//!
//! All integers are little endian and every record has the same size.

use std::path::Path;

use lazylayer_common::constants::WINDOW_SIZE;
use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::types::SpanId;

use crate::index::{Checkpoint, GzipIndex};

/// Size of the artifact header in bytes.
pub const HEADER_LEN: usize = 4 + 8;

/// Size of one checkpoint record in bytes.
pub const RECORD_LEN: usize = 4 + 8 + 8 + 1 + WINDOW_SIZE;

impl GzipIndex {
    /// Encodes the index into its artifact form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.checkpoints.len() * RECORD_LEN);
        #[allow(clippy::cast_possible_truncation)]
        let count = self.checkpoints.len() as u32;
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&self.span_size.to_le_bytes());
        for checkpoint in &self.checkpoints {
            out.extend_from_slice(&checkpoint.span.get().to_le_bytes());
            out.extend_from_slice(&checkpoint.compressed_offset.to_le_bytes());
            out.extend_from_slice(&checkpoint.uncompressed_offset.to_le_bytes());
            out.push(checkpoint.bits);
            out.extend_from_slice(&checkpoint.window);
        }
        out
    }

    /// Decodes an artifact produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Format` when the header is short, declares
    /// more checkpoints than the data holds, is followed by trailing bytes,
    /// or when the checkpoints are not sequential and strictly increasing.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(LazyLayerError::format(format!(
                "span index header needs {HEADER_LEN} bytes, got {}",
                data.len()
            )));
        }
        let count = le_u32(&data[0..4]);
        let span_size = le_u64(&data[4..12]);
        let body = &data[HEADER_LEN..];

        let needed = u64::from(count) * RECORD_LEN as u64;
        if needed > body.len() as u64 {
            return Err(LazyLayerError::format(format!(
                "span index declares {count} checkpoints but only {} bytes follow the header",
                body.len()
            )));
        }
        if needed < body.len() as u64 {
            return Err(LazyLayerError::format(format!(
                "{} trailing bytes after {count} checkpoints",
                body.len() as u64 - needed
            )));
        }
        if count > 0 && span_size == 0 {
            return Err(LazyLayerError::format("span size of zero"));
        }

        let mut checkpoints: Vec<Checkpoint> = Vec::with_capacity(body.len() / RECORD_LEN);
        for (i, record) in body.chunks_exact(RECORD_LEN).enumerate() {
            let checkpoint = Checkpoint {
                span: SpanId::new(le_u32(&record[0..4])),
                compressed_offset: le_u64(&record[4..12]),
                uncompressed_offset: le_u64(&record[12..20]),
                bits: record[20],
                window: record[21..].into(),
            };
            validate(&checkpoint, i, checkpoints.last())?;
            checkpoints.push(checkpoint);
        }
        Ok(Self {
            span_size,
            checkpoints,
        })
    }

    /// Writes the artifact to `path`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Io` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()).map_err(|e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), spans = self.checkpoints.len(), "saved span index");
        Ok(())
    }

    /// Reads an artifact from `path`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Io` if the file cannot be read and
    /// `LazyLayerError::Format` if it is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_bytes(&data)
    }
}

fn validate(checkpoint: &Checkpoint, position: usize, previous: Option<&Checkpoint>) -> Result<()> {
    if checkpoint.span.index() != position {
        return Err(LazyLayerError::format(format!(
            "checkpoint {position} carries span id {}",
            checkpoint.span
        )));
    }
    if checkpoint.bits > 7 {
        return Err(LazyLayerError::format(format!(
            "checkpoint {position} has {} unused bits",
            checkpoint.bits
        )));
    }
    if checkpoint.bits > 0 && checkpoint.compressed_offset == 0 {
        return Err(LazyLayerError::format(format!(
            "checkpoint {position} starts inside a byte before the stream"
        )));
    }
    match previous {
        None if checkpoint.uncompressed_offset != 0 => Err(LazyLayerError::format(
            "first checkpoint does not start at uncompressed offset 0",
        )),
        Some(prev)
            if checkpoint.compressed_offset <= prev.compressed_offset
                || checkpoint.uncompressed_offset <= prev.uncompressed_offset =>
        {
            Err(LazyLayerError::format(format!(
                "checkpoint {position} does not advance past checkpoint {}",
                prev.span
            )))
        }
        _ => Ok(()),
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use flate2::Compression;

    use super::*;
    use crate::index::SpanIndex;
    use crate::index::tests::{gzip, sample};

    fn built() -> GzipIndex {
        let data = sample(400_000, 21);
        let gz = gzip(&data, Compression::default());
        GzipIndex::build(&gz[..], 64 * 1024).expect("build").0
    }

    #[test]
    fn roundtrip_preserves_checkpoints() {
        let index = built();
        let decoded = GzipIndex::from_bytes(&index.to_bytes()).expect("decode");
        assert_eq!(decoded.span_count(), index.span_count());
        assert_eq!(decoded.span_size(), index.span_size());
        for (a, b) in decoded.checkpoints().iter().zip(index.checkpoints()) {
            assert_eq!(a.compressed_offset(), b.compressed_offset());
            assert_eq!(a.uncompressed_offset(), b.uncompressed_offset());
            assert_eq!(a.bits(), b.bits());
            assert_eq!(a.window(), b.window());
        }
        assert_eq!(decoded, index);
    }

    #[test]
    fn encoded_length_is_header_plus_records() {
        let index = built();
        assert_eq!(
            index.to_bytes().len(),
            HEADER_LEN + index.span_count() * RECORD_LEN
        );
    }

    #[test]
    fn zero_checkpoints_is_valid() {
        let mut data = 0u32.to_le_bytes().to_vec();
        data.extend_from_slice(&(1u64 << 22).to_le_bytes());
        let index = GzipIndex::from_bytes(&data).expect("empty index");
        assert_eq!(index.span_count(), 0);
        assert_eq!(index.span_size(), 1 << 22);
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            GzipIndex::from_bytes(&[1, 0, 0]),
            Err(LazyLayerError::Format { .. })
        ));
    }

    #[test]
    fn count_larger_than_body_is_rejected() {
        let mut data = built().to_bytes();
        data[0..4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            GzipIndex::from_bytes(&data),
            Err(LazyLayerError::Format { .. })
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let data = built().to_bytes();
        assert!(GzipIndex::from_bytes(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut data = built().to_bytes();
        data.push(0);
        assert!(GzipIndex::from_bytes(&data).is_err());
    }

    #[test]
    fn out_of_order_checkpoints_are_rejected() {
        let index = built();
        assert!(index.span_count() >= 2);
        let mut data = index.to_bytes();
        let second = HEADER_LEN + RECORD_LEN;
        // Move the second checkpoint's uncompressed offset back to zero.
        data[second + 12..second + 20].copy_from_slice(&0u64.to_le_bytes());
        assert!(GzipIndex::from_bytes(&data).is_err());
    }

    #[test]
    fn save_and_load_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("layer.zinfo");
        let index = built();
        index.save(&path).expect("save");
        assert_eq!(GzipIndex::load(&path).expect("load"), index);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            GzipIndex::load(&dir.path().join("missing.zinfo")),
            Err(LazyLayerError::Io { .. })
        ));
    }
}
