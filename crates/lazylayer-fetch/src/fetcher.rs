//! Rate-limited background prefetch.
//!
//! A single loop takes one resolver from the queue per rate-limiter tick
//! and runs one of its steps on a separate task. Foreground reads share the
//! span managers with these steps, so the rate bounds how much bandwidth
//! prefetch can take from them. A pause signal, sent when a new layer is
//! mounted, silences the loop for a while.

use std::fmt;
use std::sync::Arc;

use lazylayer_common::config::BackgroundFetchConfig;
use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::metrics::{MetricsSink, NoopMetrics};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::resolver::Resolver;

type Queue = mpsc::Sender<Arc<dyn Resolver>>;

struct Receivers {
    queue: mpsc::Receiver<Arc<dyn Resolver>>,
    pause: mpsc::Receiver<()>,
}

/// Queue of resolvers drained at a fixed rate.
pub struct BackgroundFetcher {
    config: BackgroundFetchConfig,
    queue: Queue,
    pause: mpsc::Sender<()>,
    receivers: Mutex<Receivers>,
    metrics: Arc<dyn MetricsSink>,
    closed: CancellationToken,
}

impl BackgroundFetcher {
    /// Creates a fetcher reporting to a no-op metrics sink.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` if `config` is invalid.
    pub fn new(config: BackgroundFetchConfig) -> Result<Self> {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Creates a fetcher reporting to `metrics`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` if `config` is invalid.
    pub fn with_metrics(config: BackgroundFetchConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        let (queue, queue_rx) = mpsc::channel(config.max_queue_size);
        let (pause, pause_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            queue,
            pause,
            receivers: Mutex::new(Receivers {
                queue: queue_rx,
                pause: pause_rx,
            }),
            metrics,
            closed: CancellationToken::new(),
        })
    }

    /// Queues `resolver`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Closed` after [`close`](Self::close).
    pub async fn add(&self, resolver: Arc<dyn Resolver>) -> Result<()> {
        let closed = || LazyLayerError::Closed {
            resource: "background fetcher",
        };
        if self.closed.is_cancelled() {
            return Err(closed());
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(closed()),
            sent = self.queue.send(resolver) => sent.map_err(|_| closed()),
        }
    }

    /// Asks the fetch loop to stay silent for the configured period.
    /// Never blocks; signals beyond one pending are dropped.
    pub fn pause(&self) {
        if self.pause.try_send(()).is_ok() {
            tracing::debug!("background fetch pause requested");
        }
    }

    /// Stops the fetch loop and rejects further [`add`](Self::add) calls.
    /// Repeated calls are harmless.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            tracing::info!("background fetcher closed");
        }
    }

    /// Number of resolvers waiting in the queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Runs the fetch loop until `token` is cancelled or the fetcher is
    /// closed. Steps still running are cancelled before returning.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` if the loop is already running.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let Ok(mut receivers) = self.receivers.try_lock() else {
            return Err(LazyLayerError::Config {
                message: "background fetcher is already running".into(),
            });
        };
        let stop = token.child_token();
        let mut limiter = tokio::time::interval(self.config.fetch_period());
        limiter.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_emit = Instant::now();
        let mut steps = JoinSet::new();
        tracing::info!(
            fetch_period = ?self.config.fetch_period(),
            max_queue_size = self.config.max_queue_size,
            "background fetcher started"
        );

        loop {
            let mut paused = false;
            while receivers.pause.try_recv().is_ok() {
                paused = true;
            }
            if paused {
                tracing::debug!(silence = ?self.config.silence_period(), "background fetch paused");
                tokio::select! {
                    () = token.cancelled() => break,
                    () = self.closed.cancelled() => break,
                    () = tokio::time::sleep(self.config.silence_period()) => continue,
                }
            }
            if token.is_cancelled() || self.closed.is_cancelled() {
                break;
            }

            if let Ok(resolver) = receivers.queue.try_recv() {
                if resolver.closed() {
                    tracing::debug!("dropping closed resolver");
                } else {
                    let _ = steps.spawn(step(
                        resolver,
                        self.queue.clone(),
                        Arc::clone(&self.metrics),
                        stop.clone(),
                    ));
                }
            }
            while let Some(joined) = steps.try_join_next() {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "background fetch step panicked");
                }
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = self.closed.cancelled() => break,
                _ = limiter.tick() => {}
            }
            if last_emit.elapsed() >= self.config.emit_metric_period() {
                self.metrics.background_queue_depth(self.queue_depth());
                last_emit = Instant::now();
            }
        }

        stop.cancel();
        while steps.join_next().await.is_some() {}
        tracing::info!(queued = self.queue_depth(), "background fetcher stopped");
        Ok(())
    }
}

/// Runs one resolver step and requeues the resolver if it has more work.
async fn step(
    resolver: Arc<dyn Resolver>,
    queue: Queue,
    metrics: Arc<dyn MetricsSink>,
    stop: CancellationToken,
) {
    let outcome = tokio::select! {
        () = stop.cancelled() => return,
        outcome = resolver.resolve() => outcome,
    };
    match outcome {
        Ok(true) => {
            metrics.background_fetch_succeeded();
            tokio::select! {
                () = stop.cancelled() => {}
                sent = queue.send(resolver) => {
                    if sent.is_err() {
                        tracing::debug!("fetch queue gone, dropping resolver");
                    }
                }
            }
        }
        Ok(false) => tracing::debug!("resolver finished"),
        Err(e) => {
            metrics.background_fetch_failed();
            tracing::warn!(error = %e, "background fetch failed, dropping resolver");
        }
    }
}

impl fmt::Debug for BackgroundFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundFetcher")
            .field("config", &self.config)
            .field("queue_depth", &self.queue_depth())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}
