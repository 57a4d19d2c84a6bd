//! Configuration model for span managers and the background fetcher.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{LazyLayerError, Result};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyLayerConfig {
    /// Uncompressed distance between checkpoints when building an index.
    pub span_size: u64,
    /// Settings shared by every span manager.
    pub span_manager: SpanManagerConfig,
    /// Settings of the background fetcher.
    pub background_fetch: BackgroundFetchConfig,
}

impl Default for LazyLayerConfig {
    fn default() -> Self {
        Self {
            span_size: constants::DEFAULT_SPAN_SIZE,
            span_manager: SpanManagerConfig::default(),
            background_fetch: BackgroundFetchConfig::default(),
        }
    }
}

impl LazyLayerConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| LazyLayerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the system unusable.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.span_size == 0 {
            return Err(LazyLayerError::Config {
                message: "span_size must be greater than zero".into(),
            });
        }
        self.background_fetch.validate()
    }
}

/// Settings of a span manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanManagerConfig {
    /// Number of re-fetches after a digest mismatch before giving up.
    pub max_retries: u32,
}

impl Default for SpanManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: constants::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Settings of the background fetcher. Durations are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundFetchConfig {
    /// Minimum spacing between two background fetch attempts.
    pub fetch_period_ms: u64,
    /// Pause applied when a new layer mount is signalled.
    pub silence_period_ms: u64,
    /// Capacity of the resolver queue.
    pub max_queue_size: usize,
    /// Cadence at which queue depth is reported to the metrics sink.
    pub emit_metric_period_ms: u64,
}

impl Default for BackgroundFetchConfig {
    fn default() -> Self {
        Self {
            fetch_period_ms: constants::DEFAULT_FETCH_PERIOD_MS,
            silence_period_ms: constants::DEFAULT_SILENCE_PERIOD_MS,
            max_queue_size: constants::DEFAULT_MAX_QUEUE_SIZE,
            emit_metric_period_ms: constants::DEFAULT_EMIT_METRIC_PERIOD_MS,
        }
    }
}

impl BackgroundFetchConfig {
    /// Minimum spacing between two background fetch attempts.
    #[must_use]
    pub const fn fetch_period(&self) -> Duration {
        Duration::from_millis(self.fetch_period_ms)
    }

    /// Pause applied when a new layer mount is signalled.
    #[must_use]
    pub const fn silence_period(&self) -> Duration {
        Duration::from_millis(self.silence_period_ms)
    }

    /// Cadence of queue depth reports.
    #[must_use]
    pub const fn emit_metric_period(&self) -> Duration {
        Duration::from_millis(self.emit_metric_period_ms)
    }

    /// Checks that the queue and the rate limiter can operate.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` for a zero queue size, fetch period
    /// or metric period.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(LazyLayerError::Config {
                message: "background_fetch.max_queue_size must be greater than zero".into(),
            });
        }
        if self.fetch_period_ms == 0 {
            return Err(LazyLayerError::Config {
                message: "background_fetch.fetch_period_ms must be greater than zero".into(),
            });
        }
        if self.emit_metric_period_ms == 0 {
            return Err(LazyLayerError::Config {
                message: "background_fetch.emit_metric_period_ms must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LazyLayerConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.span_manager.max_retries, 3);
        assert_eq!(config.background_fetch.fetch_period(), Duration::from_millis(500));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"span_size": 65536, "span_manager": {"max_retries": 5}}"#)
            .expect("write config");

        let config = LazyLayerConfig::load(&path).expect("load");
        assert_eq!(config.span_size, 65536);
        assert_eq!(config.span_manager.max_retries, 5);
        assert_eq!(config.background_fetch, BackgroundFetchConfig::default());
    }

    #[test]
    fn load_rejects_zero_span_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"span_size": 0}"#).expect("write config");
        assert!(matches!(
            LazyLayerConfig::load(&path),
            Err(LazyLayerError::Config { .. })
        ));
    }

    #[test]
    fn load_missing_file_returns_io_error() {
        let result = LazyLayerConfig::load(Path::new("/nonexistent/lazylayer.json"));
        assert!(matches!(result, Err(LazyLayerError::Io { .. })));
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let config = BackgroundFetchConfig {
            max_queue_size: 0,
            ..BackgroundFetchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
