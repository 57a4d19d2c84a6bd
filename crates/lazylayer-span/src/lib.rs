//! # lazylayer-span
//!
//! On-demand access to the spans of one gzip layer.
//!
//! Handles:
//! - **State**: per-span state machine guarded by an async lock.
//! - **Seams**: blob cache, compressed-content reader and span verifier
//!   traits with in-memory and on-disk implementations.
//! - **Reads**: [`SpanManager`](manager::SpanManager) turns uncompressed
//!   byte ranges into span fetches, verification and decompression.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cache;
pub mod contents;
pub mod manager;
pub mod reader;
pub mod span;
pub mod verify;

pub use manager::{SpanManager, SpanManagerBuilder};
