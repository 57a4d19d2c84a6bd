//! # lazylayer-zinfo
//!
//! Random-access index over gzip-compressed layers.
//!
//! Handles:
//! - **Decoding**: a DEFLATE decoder that can resume at any block boundary
//!   given the preceding 32 KiB of output.
//! - **Indexing**: one pass over a gzip stream recording a checkpoint
//!   every `span_size` uncompressed bytes.
//! - **Artifacts**: the binary `.zinfo` form of an index and its JSON
//!   manifest with per-span digests.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod codec;
mod gzip;
pub mod index;
mod inflate;
pub mod manifest;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use lazylayer_common::error::{LazyLayerError, Result};

pub use index::{Checkpoint, GzipIndex, SpanIndex, StreamSizes};
pub use manifest::LayerManifest;

/// Indexes the gzip layer at `path` and hashes its spans.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or is not a valid gzip
/// stream.
pub fn index_file(path: &Path, span_size: u64) -> Result<(GzipIndex, LayerManifest)> {
    tracing::info!(layer = %path.display(), span_size, "indexing layer");
    let open = || {
        File::open(path).map_err(|e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    };
    let (index, sizes) = GzipIndex::build(BufReader::new(open()?), span_size)?;
    let manifest = LayerManifest::compute(&index, sizes, &mut BufReader::new(open()?))?;
    Ok((index, manifest))
}
