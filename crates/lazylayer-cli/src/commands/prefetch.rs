//! `llz prefetch` — Fetch every span of a layer in the background.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use lazylayer_common::config::LazyLayerConfig;
use lazylayer_common::metrics::{AtomicMetrics, MetricsSink};
use lazylayer_fetch::{BackgroundFetcher, SequentialResolver};
use lazylayer_span::SpanManager;
use tokio_util::sync::CancellationToken;

use super::LayerArgs;

/// Arguments for the `prefetch` command.
#[derive(Args, Debug)]
pub struct PrefetchArgs {
    /// Layer and artifact locations.
    #[command(flatten)]
    pub layer: LayerArgs,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,
}

/// Executes the `prefetch` command.
///
/// Runs a background fetcher with the configured rate until every span is
/// cached, then prints the collected metrics as JSON.
///
/// # Errors
///
/// Returns an error if the layer cannot be opened, the fetcher fails or
/// gives up on a span, or the timeout expires first.
pub fn execute(args: PrefetchArgs, config: &LazyLayerConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(AtomicMetrics::new());
    let manager = Arc::new(
        args.layer
            .open_manager(config, Arc::clone(&metrics) as Arc<dyn MetricsSink>)?,
    );
    let fetcher = Arc::new(BackgroundFetcher::with_metrics(
        config.background_fetch,
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
    )?);
    tracing::info!(
        layer = %args.layer.layer.display(),
        spans = manager.span_count(),
        "prefetching layer"
    );

    super::block_on(async {
        let token = CancellationToken::new();
        let run = {
            let fetcher = Arc::clone(&fetcher);
            let token = token.clone();
            tokio::spawn(async move { fetcher.run(token).await })
        };
        fetcher
            .add(Arc::new(SequentialResolver::new(Arc::clone(&manager))))
            .await?;

        let waited = wait_for_spans(
            &manager,
            &metrics,
            config.background_fetch.fetch_period(),
            Duration::from_secs(args.timeout_secs),
        )
        .await;
        token.cancel();
        run.await??;
        waited
    })??;
    manager.close()?;

    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    Ok(())
}

/// Polls until no span is pending.
///
/// A failed background fetch drops its resolver, so the remaining spans
/// would never be fetched; the wait stops at the first reported failure.
async fn wait_for_spans(
    manager: &SpanManager,
    metrics: &AtomicMetrics,
    poll: Duration,
    timeout: Duration,
) -> anyhow::Result<()> {
    let wait = async {
        loop {
            if manager.pending_spans().is_empty() {
                return Ok(());
            }
            let failures = metrics.snapshot().background_failures;
            if failures > 0 {
                anyhow::bail!(
                    "background fetch failed {failures} time(s) with {} of {} spans pending",
                    manager.pending_spans().len(),
                    manager.span_count()
                );
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(timeout, wait).await.map_err(|_| {
        anyhow::anyhow!(
            "{} of {} spans still pending after {timeout:?}",
            manager.pending_spans().len(),
            manager.span_count()
        )
    })?
}
