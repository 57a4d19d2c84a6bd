//! System-wide constants and defaults.

/// Default uncompressed distance between two checkpoints (4 MiB).
pub const DEFAULT_SPAN_SIZE: u64 = 4 * 1024 * 1024;

/// Size of the DEFLATE back-reference window stored with each checkpoint.
pub const WINDOW_SIZE: usize = 32 * 1024;

/// Default number of re-fetches after a digest mismatch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default minimum spacing between two background fetch attempts.
pub const DEFAULT_FETCH_PERIOD_MS: u64 = 500;

/// Default pause applied when a new layer mount is signalled.
pub const DEFAULT_SILENCE_PERIOD_MS: u64 = 30_000;

/// Default capacity of the background fetch queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Default cadence of background fetch telemetry.
pub const DEFAULT_EMIT_METRIC_PERIOD_MS: u64 = 10_000;

/// File extension of the binary span index artifact.
pub const ZINFO_EXTENSION: &str = "zinfo";

/// File extension of the JSON layer manifest stored next to the index.
pub const MANIFEST_EXTENSION: &str = "zinfo.json";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Binary name for the CLI.
pub const BIN_NAME: &str = "llz";
