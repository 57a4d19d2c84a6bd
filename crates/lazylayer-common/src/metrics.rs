//! Observability seam for span managers and the background fetcher.
//!
//! Components receive an `Arc<dyn MetricsSink>` instead of writing to
//! process-wide counters. [`NoopMetrics`] is the default;
//! [`AtomicMetrics`] keeps in-process counters that can be snapshotted.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::SpanId;

/// Receives telemetry events. Every method defaults to doing nothing.
pub trait MetricsSink: Send + Sync {
    /// Compressed bytes of a span were read from the backing reader.
    fn span_fetched(&self, _span: SpanId, _compressed_bytes: u64) {}

    /// A span was decompressed and its uncompressed bytes cached.
    fn span_uncompressed(&self, _span: SpanId, _uncompressed_bytes: u64) {}

    /// A fetched span failed digest verification.
    fn digest_mismatch(&self, _span: SpanId) {}

    /// An on-demand read returned `bytes` bytes.
    fn on_demand_read(&self, _bytes: u64) {}

    /// A background resolve step succeeded.
    fn background_fetch_succeeded(&self) {}

    /// A background resolve step failed and its resolver was dropped.
    fn background_fetch_failed(&self) {}

    /// Periodic report of the background queue depth.
    fn background_queue_depth(&self, _depth: usize) {}
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Point-in-time copy of [`AtomicMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Number of span fetches from the backing reader.
    pub spans_fetched: u64,
    /// Compressed bytes read from the backing reader.
    pub compressed_bytes_fetched: u64,
    /// Number of spans decompressed.
    pub spans_uncompressed: u64,
    /// Uncompressed bytes produced.
    pub uncompressed_bytes: u64,
    /// Digest verification failures.
    pub digest_mismatches: u64,
    /// On-demand reads served.
    pub on_demand_reads: u64,
    /// Bytes returned by on-demand reads.
    pub on_demand_bytes: u64,
    /// Successful background resolve steps.
    pub background_fetches: u64,
    /// Failed background resolve steps.
    pub background_failures: u64,
    /// Last reported background queue depth.
    pub background_queue_depth: u64,
}

/// Lock-free in-process counters.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    spans_fetched: AtomicU64,
    compressed_bytes_fetched: AtomicU64,
    spans_uncompressed: AtomicU64,
    uncompressed_bytes: AtomicU64,
    digest_mismatches: AtomicU64,
    on_demand_reads: AtomicU64,
    on_demand_bytes: AtomicU64,
    background_fetches: AtomicU64,
    background_failures: AtomicU64,
    background_queue_depth: AtomicU64,
}

impl AtomicMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            spans_fetched: self.spans_fetched.load(Ordering::Relaxed),
            compressed_bytes_fetched: self.compressed_bytes_fetched.load(Ordering::Relaxed),
            spans_uncompressed: self.spans_uncompressed.load(Ordering::Relaxed),
            uncompressed_bytes: self.uncompressed_bytes.load(Ordering::Relaxed),
            digest_mismatches: self.digest_mismatches.load(Ordering::Relaxed),
            on_demand_reads: self.on_demand_reads.load(Ordering::Relaxed),
            on_demand_bytes: self.on_demand_bytes.load(Ordering::Relaxed),
            background_fetches: self.background_fetches.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
            background_queue_depth: self.background_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for AtomicMetrics {
    fn span_fetched(&self, _span: SpanId, compressed_bytes: u64) {
        let _ = self.spans_fetched.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .compressed_bytes_fetched
            .fetch_add(compressed_bytes, Ordering::Relaxed);
    }

    fn span_uncompressed(&self, _span: SpanId, uncompressed_bytes: u64) {
        let _ = self.spans_uncompressed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .uncompressed_bytes
            .fetch_add(uncompressed_bytes, Ordering::Relaxed);
    }

    fn digest_mismatch(&self, _span: SpanId) {
        let _ = self.digest_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_demand_read(&self, bytes: u64) {
        let _ = self.on_demand_reads.fetch_add(1, Ordering::Relaxed);
        let _ = self.on_demand_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn background_fetch_succeeded(&self) {
        let _ = self.background_fetches.fetch_add(1, Ordering::Relaxed);
    }

    fn background_fetch_failed(&self) {
        let _ = self.background_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn background_queue_depth(&self, depth: usize) {
        self.background_queue_depth
            .store(depth as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_metrics_accumulate() {
        let metrics = AtomicMetrics::new();
        metrics.span_fetched(SpanId::new(0), 100);
        metrics.span_fetched(SpanId::new(1), 50);
        metrics.on_demand_read(10);
        metrics.background_queue_depth(7);
        metrics.background_queue_depth(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.spans_fetched, 2);
        assert_eq!(snapshot.compressed_bytes_fetched, 150);
        assert_eq!(snapshot.on_demand_reads, 1);
        assert_eq!(snapshot.background_queue_depth, 3);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let json = serde_json::to_string(&MetricsSnapshot::default()).expect("serialize");
        assert!(json.contains("\"spans_fetched\":0"));
    }
}
