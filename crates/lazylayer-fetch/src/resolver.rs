//! Units of background work.
//!
//! A resolver performs one small step of prefetch per call. The background
//! fetcher keeps calling it, one step per rate-limiter tick, until it
//! reports that nothing is left.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lazylayer_common::error::Result;
use lazylayer_common::types::SpanId;
use lazylayer_span::SpanManager;
use tokio::sync::Mutex;

/// One layer's worth of background work.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Performs one step. `Ok(true)` asks to be scheduled again,
    /// `Ok(false)` means the work is complete.
    ///
    /// # Errors
    ///
    /// Any error ends the work; the fetcher drops the resolver.
    async fn resolve(&self) -> Result<bool>;

    /// Stops further steps.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing the resolver fails.
    fn close(&self) -> Result<()>;

    /// Returns `true` after [`close`](Self::close).
    fn closed(&self) -> bool;
}

/// Fetches the spans of one layer in ascending order.
pub struct SequentialResolver {
    manager: Arc<SpanManager>,
    next: Mutex<SpanId>,
    closed: AtomicBool,
}

impl SequentialResolver {
    /// Starts at span 0 of `manager`.
    #[must_use]
    pub fn new(manager: Arc<SpanManager>) -> Self {
        Self {
            manager,
            next: Mutex::new(SpanId::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Span the next step will fetch.
    pub async fn next_span(&self) -> SpanId {
        *self.next.lock().await
    }
}

#[async_trait]
impl Resolver for SequentialResolver {
    async fn resolve(&self) -> Result<bool> {
        if self.closed() {
            return Ok(false);
        }
        let mut next = self.next.lock().await;
        let id = *next;
        match self.manager.fetch_single_span(id).await {
            Ok(()) => {
                tracing::trace!(span = %id, "background fetched span");
                match id.next() {
                    Some(following) => {
                        *next = following;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Err(e) if e.is_exceeds_max_span() => {
                tracing::debug!(spans = id.get(), "background fetch of layer complete");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SequentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialResolver")
            .field("manager", &self.manager)
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}
