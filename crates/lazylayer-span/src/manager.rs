//! Span manager: fetch, verify, decompress and cache the spans of one layer.
//!
//! One manager exists per mounted layer and is shared by foreground reads
//! and background prefetch. Within a span only the lock holder changes
//! state, so concurrent requests for the same span read the compressed
//! bytes once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use lazylayer_common::config::SpanManagerConfig;
use lazylayer_common::constants::DEFAULT_MAX_RETRIES;
use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::metrics::{MetricsSink, NoopMetrics};
use lazylayer_common::types::{SpanId, SpanState};
use lazylayer_zinfo::{LayerManifest, SpanIndex, StreamSizes};

use crate::cache::{self, BlobCache, MemoryCache};
use crate::contents::Contents;
use crate::reader::{self, ContentReader};
use crate::span::{Span, SpanGuard};
use crate::verify::{DigestVerifier, SpanVerifier};

/// Builder for a [`SpanManager`].
pub struct SpanManagerBuilder {
    index: Arc<dyn SpanIndex>,
    sizes: StreamSizes,
    reader: Arc<dyn ContentReader>,
    cache: Option<Arc<dyn BlobCache>>,
    verifier: Option<Arc<dyn SpanVerifier>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    max_retries: u32,
}

impl SpanManagerBuilder {
    /// Starts a builder for the layer described by `index` and `sizes`,
    /// reading compressed bytes from `reader`.
    #[must_use]
    pub fn new(index: Arc<dyn SpanIndex>, sizes: StreamSizes, reader: Arc<dyn ContentReader>) -> Self {
        Self {
            index,
            sizes,
            reader,
            cache: None,
            verifier: None,
            metrics: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Starts a builder that verifies spans against `manifest`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Format` if the manifest does not describe
    /// `index`.
    pub fn from_manifest(
        index: Arc<dyn SpanIndex>,
        manifest: &LayerManifest,
        reader: Arc<dyn ContentReader>,
    ) -> Result<Self> {
        manifest.validate_against(index.as_ref())?;
        Ok(Self::new(index, manifest.sizes(), reader)
            .verifier(Arc::new(DigestVerifier::from_manifest(manifest))))
    }

    /// Sets the cache. Defaults to a fresh [`MemoryCache`].
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn BlobCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the verifier applied to fetched compressed bytes.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn SpanVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Sets the metrics sink. Defaults to [`NoopMetrics`].
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets how often a digest mismatch is retried.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Applies the span manager section of the configuration.
    #[must_use]
    pub const fn config(self, config: &SpanManagerConfig) -> Self {
        self.max_retries(config.max_retries)
    }

    /// Builds the manager with every span `Unrequested`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` if no verifier was set and
    /// `LazyLayerError::Format` if the reader is shorter than the layer.
    pub fn build(self) -> Result<SpanManager> {
        let verifier = self.verifier.ok_or_else(|| LazyLayerError::Config {
            message: "a span verifier is required".to_string(),
        })?;
        if self.reader.size() < self.sizes.compressed {
            return Err(LazyLayerError::format(format!(
                "reader holds {} bytes, layer is {} bytes",
                self.reader.size(),
                self.sizes.compressed
            )));
        }

        let mut spans = Vec::with_capacity(self.index.span_count());
        for i in 0..self.index.span_count() {
            let id = SpanId::new(
                u32::try_from(i).map_err(|_| LazyLayerError::format("too many spans"))?,
            );
            let compressed = (
                self.index.start_compressed_offset(id)?,
                self.index.end_compressed_offset(id, self.sizes.compressed)?,
            );
            let uncompressed = (
                self.index.start_uncompressed_offset(id)?,
                self.index.end_uncompressed_offset(id, self.sizes.uncompressed)?,
            );
            if compressed.1 < compressed.0 || uncompressed.1 < uncompressed.0 {
                return Err(LazyLayerError::format(format!(
                    "span {id} has a negative range for the given stream sizes"
                )));
            }
            spans.push(Span::new(id, compressed, uncompressed));
        }
        if spans.is_empty() && self.sizes.uncompressed > 0 {
            return Err(LazyLayerError::format(
                "index has no spans for a non-empty layer",
            ));
        }

        tracing::info!(
            spans = spans.len(),
            compressed = self.sizes.compressed,
            uncompressed = self.sizes.uncompressed,
            max_retries = self.max_retries,
            "created span manager"
        );
        Ok(SpanManager {
            index: self.index,
            spans,
            sizes: self.sizes,
            reader: self.reader,
            cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
            verifier,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            max_retries: self.max_retries,
            closed: AtomicBool::new(false),
        })
    }
}

impl fmt::Debug for SpanManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanManagerBuilder")
            .field("sizes", &self.sizes)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Serves uncompressed byte ranges of one layer, fetching spans on demand.
pub struct SpanManager {
    index: Arc<dyn SpanIndex>,
    spans: Vec<Span>,
    sizes: StreamSizes,
    reader: Arc<dyn ContentReader>,
    cache: Arc<dyn BlobCache>,
    verifier: Arc<dyn SpanVerifier>,
    metrics: Arc<dyn MetricsSink>,
    max_retries: u32,
    closed: AtomicBool,
}

impl SpanManager {
    /// Number of spans in the layer.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Last valid span id, `None` for an empty layer.
    #[must_use]
    pub fn max_span_id(&self) -> Option<SpanId> {
        self.index.max_span_id()
    }

    /// Size of the decompressed layer.
    #[must_use]
    pub const fn uncompressed_size(&self) -> u64 {
        self.sizes.uncompressed
    }

    /// Size of the compressed layer.
    #[must_use]
    pub const fn compressed_size(&self) -> u64 {
        self.sizes.compressed
    }

    /// Current state of `id`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::ExceedsMaxSpan` for an unknown span.
    pub fn span_state(&self, id: SpanId) -> Result<SpanState> {
        Ok(self.span(id)?.state())
    }

    /// Spans whose compressed bytes are not cached yet.
    #[must_use]
    pub fn pending_spans(&self) -> Vec<SpanId> {
        self.spans
            .iter()
            .filter(|s| matches!(s.state(), SpanState::Unrequested | SpanState::Requested))
            .map(Span::id)
            .collect()
    }

    /// Returns `true` after [`close`](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fetches, verifies and caches the compressed bytes of `id` without
    /// decompressing them. Does nothing unless the span is `Unrequested`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::ExceedsMaxSpan` past the last span (no
    /// state changes), `LazyLayerError::DigestMismatch` once retries are
    /// exhausted, `LazyLayerError::Transport` on read failure and
    /// `LazyLayerError::Closed` after [`close`](Self::close).
    pub async fn fetch_single_span(&self, id: SpanId) -> Result<()> {
        self.ensure_open()?;
        let span = self.span(id)?;
        if span.state() != SpanState::Unrequested {
            return Ok(());
        }
        let guard = span.lock().await;
        if guard.state() != SpanState::Unrequested {
            return Ok(());
        }
        guard.set_state(SpanState::Requested)?;
        let compressed = self.fetch_with_retry(span).await?;
        cache::put(self.cache.as_ref(), &id.cache_key(), Bytes::from(compressed)).await?;
        guard.set_state(SpanState::Fetched)?;
        Ok(())
    }

    /// Returns the uncompressed bytes in `start..end`.
    ///
    /// Every overlapping span is resolved concurrently; the first failure
    /// cancels the others.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::OutOfRange` unless
    /// `start <= end <= uncompressed_size`, and any error of fetching,
    /// verifying or decompressing a span.
    pub async fn get_contents(&self, start: u64, end: u64) -> Result<Contents> {
        self.ensure_open()?;
        if start > end || end > self.sizes.uncompressed {
            return Err(LazyLayerError::OutOfRange {
                start,
                end,
                size: self.sizes.uncompressed,
            });
        }
        if start == end {
            return Ok(Contents::default());
        }

        let first = self.span_at(start)?;
        let last = self.span_at(end - 1)?;
        let reads = self.spans[first.index()..=last.index()].iter().map(|span| {
            let lo = start.max(span.start_uncompressed_offset());
            let hi = end.min(span.end_uncompressed_offset());
            self.read_span(span, lo - span.start_uncompressed_offset(), hi - lo)
        });
        let chunks = futures::future::try_join_all(reads).await?;
        self.metrics.on_demand_read(end - start);
        tracing::trace!(start, end, spans = chunks.len(), "served range");
        Ok(Contents::new(chunks))
    }

    /// Returns all uncompressed bytes of span `id`.
    ///
    /// # Errors
    ///
    /// Same as [`get_contents`](Self::get_contents), plus
    /// `LazyLayerError::ExceedsMaxSpan` for an unknown span.
    pub async fn get_span_content(&self, id: SpanId) -> Result<Bytes> {
        self.ensure_open()?;
        let span = self.span(id)?;
        self.read_span(span, 0, span.uncompressed_len()).await
    }

    /// Marks the manager closed and closes its cache.
    ///
    /// Calls already in flight are not waited for.
    ///
    /// # Errors
    ///
    /// Returns the cache's error if it fails to close.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cache.close()?;
        tracing::info!(spans = self.spans.len(), "closed span manager");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(LazyLayerError::Closed {
                resource: "span manager",
            });
        }
        Ok(())
    }

    fn span(&self, id: SpanId) -> Result<&Span> {
        self.spans
            .get(id.index())
            .ok_or_else(|| LazyLayerError::ExceedsMaxSpan {
                span: id,
                max_span: self.max_span_id(),
            })
    }

    fn span_at(&self, offset: u64) -> Result<SpanId> {
        self.index
            .uncompressed_offset_to_span_id(offset)
            .ok_or_else(|| LazyLayerError::format(format!("no span holds offset {offset}")))
    }

    /// Bytes `offset..offset + len` of one span, relative to its start.
    async fn read_span(&self, span: &Span, offset: u64, len: u64) -> Result<Bytes> {
        if span.state() == SpanState::Uncompressed {
            return self.read_cached(span, offset, len).await;
        }
        let guard = span.lock().await;
        let data = match guard.state() {
            SpanState::Uncompressed => {
                drop(guard);
                return self.read_cached(span, offset, len).await;
            }
            SpanState::Fetched => {
                let compressed = cache::read_range(
                    self.cache.as_ref(),
                    &span.id().cache_key(),
                    0,
                    to_usize(span.compressed_len())?,
                )
                .await?;
                self.uncompress(&guard, compressed).await?
            }
            SpanState::Unrequested | SpanState::Requested => {
                guard.set_state(SpanState::Requested)?;
                let compressed = self.fetch_with_retry(span).await?;
                self.uncompress(&guard, compressed).await?
            }
        };
        let start = to_usize(offset)?;
        Ok(data.slice(start..start + to_usize(len)?))
    }

    async fn read_cached(&self, span: &Span, offset: u64, len: u64) -> Result<Bytes> {
        let data = cache::read_range(
            self.cache.as_ref(),
            &span.id().cache_key(),
            offset,
            to_usize(len)?,
        )
        .await?;
        Ok(Bytes::from(data))
    }

    /// Decompresses a span, caches the result and marks it `Uncompressed`.
    async fn uncompress(&self, guard: &SpanGuard<'_>, compressed: Vec<u8>) -> Result<Bytes> {
        let span = guard.span();
        let id = span.id();
        let index = Arc::clone(&self.index);
        let size = span.uncompressed_len();
        let offset = span.start_uncompressed_offset();
        let data = tokio::task::spawn_blocking(move || {
            index.extract_span(&compressed, size, offset, id)
        })
        .await
        .map_err(|e| LazyLayerError::Task {
            message: e.to_string(),
        })??;

        let data = Bytes::from(data);
        cache::put(self.cache.as_ref(), &id.cache_key(), data.clone()).await?;
        guard.set_state(SpanState::Uncompressed)?;
        self.metrics.span_uncompressed(id, data.len() as u64);
        Ok(data)
    }

    /// Reads and verifies the compressed bytes of a span, retrying digest
    /// mismatches up to `max_retries` times.
    async fn fetch_with_retry(&self, span: &Span) -> Result<Vec<u8>> {
        let id = span.id();
        let offset = span.start_compressed_offset();
        let len = to_usize(span.compressed_len())?;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let compressed = reader::read_exact_at(self.reader.as_ref(), offset, len).await?;
            self.metrics.span_fetched(id, len as u64);
            match self.verifier.verify(id, &compressed) {
                Ok(()) => {
                    tracing::debug!(span = %id, attempt, bytes = len, "fetched span");
                    return Ok(compressed);
                }
                Err(e) if e.is_digest_mismatch() => {
                    self.metrics.digest_mismatch(id);
                    tracing::warn!(span = %id, attempt, error = %e, "span failed verification");
                    if attempt > self.max_retries {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl fmt::Debug for SpanManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanManager")
            .field("spans", &self.spans.len())
            .field("sizes", &self.sizes)
            .field("max_retries", &self.max_retries)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| LazyLayerError::format(format!("{value} bytes do not fit in memory")))
}
