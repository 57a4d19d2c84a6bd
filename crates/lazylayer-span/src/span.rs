//! Per-span state machine.
//!
//! A [`Span`] pairs an atomic state tag with an async mutex. The tag may be
//! read without the lock as a fast path; every change goes through a
//! [`SpanGuard`], so only the lock holder performs transitions.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::types::{SpanId, SpanState};
use tokio::sync::{Mutex, MutexGuard};

/// One span of a layer with its fixed offsets and current state.
pub struct Span {
    id: SpanId,
    start_compressed: u64,
    end_compressed: u64,
    start_uncompressed: u64,
    end_uncompressed: u64,
    state: AtomicU8,
    lock: Mutex<()>,
}

impl Span {
    /// Creates an `Unrequested` span covering the given ranges.
    #[must_use]
    pub fn new(id: SpanId, compressed: (u64, u64), uncompressed: (u64, u64)) -> Self {
        Self {
            id,
            start_compressed: compressed.0,
            end_compressed: compressed.1,
            start_uncompressed: uncompressed.0,
            end_uncompressed: uncompressed.1,
            state: AtomicU8::new(SpanState::Unrequested.as_u8()),
            lock: Mutex::new(()),
        }
    }

    /// Span identifier.
    #[must_use]
    pub const fn id(&self) -> SpanId {
        self.id
    }

    /// First compressed byte of the span.
    #[must_use]
    pub const fn start_compressed_offset(&self) -> u64 {
        self.start_compressed
    }

    /// Exclusive end of the compressed bytes of the span.
    #[must_use]
    pub const fn end_compressed_offset(&self) -> u64 {
        self.end_compressed
    }

    /// First uncompressed byte of the span.
    #[must_use]
    pub const fn start_uncompressed_offset(&self) -> u64 {
        self.start_uncompressed
    }

    /// Exclusive end of the uncompressed bytes of the span.
    #[must_use]
    pub const fn end_uncompressed_offset(&self) -> u64 {
        self.end_uncompressed
    }

    /// Length of the compressed range.
    #[must_use]
    pub const fn compressed_len(&self) -> u64 {
        self.end_compressed - self.start_compressed
    }

    /// Length of the uncompressed range.
    #[must_use]
    pub const fn uncompressed_len(&self) -> u64 {
        self.end_uncompressed - self.start_uncompressed
    }

    /// Current state, read without taking the lock.
    ///
    /// The value may be stale by the time the caller acts on it; re-check
    /// through [`lock`](Self::lock) before changing anything.
    #[must_use]
    pub fn state(&self) -> SpanState {
        // Only valid tags are ever stored.
        SpanState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(SpanState::Unrequested)
    }

    /// Waits for exclusive access to the span.
    pub async fn lock(&self) -> SpanGuard<'_> {
        let guard = self.lock.lock().await;
        SpanGuard {
            span: self,
            _guard: guard,
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.id)
            .field("compressed", &(self.start_compressed..self.end_compressed))
            .field("uncompressed", &(self.start_uncompressed..self.end_uncompressed))
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a span.
///
/// Dropping the guard while the span is still `Requested` reverts it to
/// `Unrequested`, which covers both failed fetches and cancelled futures.
pub struct SpanGuard<'a> {
    span: &'a Span,
    _guard: MutexGuard<'a, ()>,
}

impl SpanGuard<'_> {
    /// The guarded span.
    #[must_use]
    pub const fn span(&self) -> &Span {
        self.span
    }

    /// Current state of the guarded span.
    #[must_use]
    pub fn state(&self) -> SpanState {
        self.span.state()
    }

    /// Moves the span to `to`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::InvalidTransition`, leaving the state
    /// unchanged, if `to` is not reachable from the current state.
    pub fn set_state(&self, to: SpanState) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(LazyLayerError::InvalidTransition {
                span: self.span.id,
                from,
                to,
            });
        }
        self.span.state.store(to.as_u8(), Ordering::Release);
        tracing::debug!(span = %self.span.id, %from, %to, "span state changed");
        Ok(())
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if self.state() == SpanState::Requested {
            self.span
                .state
                .store(SpanState::Unrequested.as_u8(), Ordering::Release);
            tracing::debug!(span = %self.span.id, "reverted unfinished request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::new(SpanId::new(3), (100, 250), (4096, 8192))
    }

    #[test]
    fn new_span_is_unrequested() {
        let s = span();
        assert_eq!(s.state(), SpanState::Unrequested);
        assert_eq!(s.compressed_len(), 150);
        assert_eq!(s.uncompressed_len(), 4096);
    }

    #[tokio::test]
    async fn allowed_transitions_are_applied() {
        let s = span();
        let guard = s.lock().await;
        guard.set_state(SpanState::Requested).expect("to requested");
        guard.set_state(SpanState::Fetched).expect("to fetched");
        guard.set_state(SpanState::Uncompressed).expect("to uncompressed");
        drop(guard);
        assert_eq!(s.state(), SpanState::Uncompressed);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_unchanged() {
        let s = span();
        let guard = s.lock().await;
        let err = guard
            .set_state(SpanState::Fetched)
            .expect_err("unrequested -> fetched");
        assert!(matches!(
            err,
            LazyLayerError::InvalidTransition {
                from: SpanState::Unrequested,
                to: SpanState::Fetched,
                ..
            }
        ));
        assert_eq!(guard.state(), SpanState::Unrequested);

        guard.set_state(SpanState::Requested).expect("to requested");
        guard.set_state(SpanState::Fetched).expect("to fetched");
        assert!(guard.set_state(SpanState::Requested).is_err());
        assert!(guard.set_state(SpanState::Unrequested).is_err());
        assert_eq!(guard.state(), SpanState::Fetched);
    }

    #[tokio::test]
    async fn dropped_guard_reverts_requested() {
        let s = span();
        {
            let guard = s.lock().await;
            guard.set_state(SpanState::Requested).expect("to requested");
        }
        assert_eq!(s.state(), SpanState::Unrequested);
    }

    #[tokio::test]
    async fn dropped_guard_keeps_fetched() {
        let s = span();
        {
            let guard = s.lock().await;
            guard.set_state(SpanState::Requested).expect("to requested");
            guard.set_state(SpanState::Fetched).expect("to fetched");
        }
        assert_eq!(s.state(), SpanState::Fetched);
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let s = span();
        let guard = s.lock().await;
        assert!(s.lock.try_lock().is_err());
        drop(guard);
        assert!(s.lock.try_lock().is_ok());
    }
}
