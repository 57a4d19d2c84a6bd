//! Unified error type for the lazylayer workspace.
//!
//! Every crate returns [`LazyLayerError`]; the binary wraps it in
//! `anyhow` at the edge.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{SpanId, SpanState};

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum LazyLayerError {
    /// A filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An index artifact or compressed stream is malformed.
    #[error("invalid format: {message}")]
    Format {
        /// Description of the malformed input.
        message: String,
    },

    /// Decompressing a single span failed.
    #[error("failed to extract span {span}: {message}")]
    Extraction {
        /// Span being extracted.
        span: SpanId,
        /// Description of the failure.
        message: String,
    },

    /// A span state change was requested along an edge that does not exist.
    #[error("invalid state transition for span {span}: {from} -> {to}")]
    InvalidTransition {
        /// Span whose state was not changed.
        span: SpanId,
        /// State the span is in.
        from: SpanState,
        /// State that was requested.
        to: SpanState,
    },

    /// Fetched span bytes did not hash to the expected digest.
    #[error("digest mismatch for span {span}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Span that failed verification.
        span: SpanId,
        /// Expected digest.
        expected: String,
        /// Digest of the bytes actually read.
        actual: String,
    },

    /// The requested span lies past the last span of the layer.
    ///
    /// This is a sentinel rather than a failure: background prefetch uses it
    /// to learn that a layer has no more work.
    #[error("span {span} exceeds the last span of the layer ({max_span:?})")]
    ExceedsMaxSpan {
        /// Requested span.
        span: SpanId,
        /// Last valid span, `None` for a layer without spans.
        max_span: Option<SpanId>,
    },

    /// Reading from the compressed-content source failed.
    #[error("failed to read compressed content at offset {offset}: {source}")]
    Transport {
        /// Compressed offset of the failed read.
        offset: u64,
        /// Underlying error reported by the reader.
        source: std::io::Error,
    },

    /// A blob cache operation failed.
    #[error("cache error for key {key}: {message}")]
    Cache {
        /// Cache key involved.
        key: String,
        /// Description of the failure.
        message: String,
    },

    /// A byte range does not fit the uncompressed layer.
    #[error("range {start}..{end} is outside of the layer (size {size})")]
    OutOfRange {
        /// Requested start offset.
        start: u64,
        /// Requested end offset.
        end: u64,
        /// Uncompressed size of the layer.
        size: u64,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The resource was used after it was closed.
    #[error("{resource} is closed")]
    Closed {
        /// Kind of resource that is closed.
        resource: &'static str,
    },

    /// A spawned task failed to complete.
    #[error("task failed: {message}")]
    Task {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl LazyLayerError {
    /// Builds a [`LazyLayerError::Format`] from any displayable message.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Returns `true` for the "no more spans" sentinel.
    #[must_use]
    pub const fn is_exceeds_max_span(&self) -> bool {
        matches!(self, Self::ExceedsMaxSpan { .. })
    }

    /// Returns `true` if the error is a digest verification failure.
    #[must_use]
    pub const fn is_digest_mismatch(&self) -> bool {
        matches!(self, Self::DigestMismatch { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LazyLayerError>;
