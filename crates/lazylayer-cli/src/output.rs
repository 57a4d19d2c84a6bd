//! Human-readable formatting for command output.

/// Formats a byte count with binary units (e.g., "4.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    match bytes {
        b if b >= GIB => format!("{:.1} GiB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MiB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB", b as f64 / KIB as f64),
        b => format!("{b} B"),
    }
}

/// Formats how much smaller `compressed` is than `uncompressed`.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_ratio(compressed: u64, uncompressed: u64) -> String {
    if compressed == 0 {
        return "-".to_string();
    }
    format!("{:.2}x", uncompressed as f64 / compressed as f64)
}

/// Shortens a digest to its first 12 hex characters.
#[must_use]
pub fn short_digest(hex: &str) -> &str {
    hex.get(..12).unwrap_or(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.0 MiB");
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }

    #[test]
    fn format_ratio_handles_empty_layer() {
        assert_eq!(format_ratio(0, 0), "-");
        assert_eq!(format_ratio(100, 350), "3.50x");
    }

    #[test]
    fn short_digest_truncates() {
        assert_eq!(short_digest("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }
}
