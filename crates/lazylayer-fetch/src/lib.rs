//! # lazylayer-fetch
//!
//! Best-effort background prefetch of mounted layers.
//!
//! Provides two entry points:
//! - [`Resolver`](resolver::Resolver) and
//!   [`SequentialResolver`](resolver::SequentialResolver): one layer's
//!   prefetch, one span per step.
//! - [`BackgroundFetcher`](fetcher::BackgroundFetcher): a rate-limited,
//!   pausable queue of resolvers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lazylayer_common::config::BackgroundFetchConfig;
//! use lazylayer_fetch::fetcher::BackgroundFetcher;
//! use lazylayer_fetch::resolver::SequentialResolver;
//! use lazylayer_span::SpanManager;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(manager: Arc<SpanManager>) -> lazylayer_common::error::Result<()> {
//! let fetcher = Arc::new(BackgroundFetcher::new(BackgroundFetchConfig::default())?);
//! fetcher.add(Arc::new(SequentialResolver::new(manager))).await?;
//! fetcher.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fetcher;
pub mod resolver;

pub use fetcher::BackgroundFetcher;
pub use resolver::{Resolver, SequentialResolver};
