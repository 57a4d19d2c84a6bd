//! Domain primitive types used across the lazylayer workspace.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a span within one layer, counted from zero.
///
/// Rendered as a plain decimal number, which is also the blob cache key
/// of the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpanId(u32);

impl SpanId {
    /// Creates a span id from its numeric value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the id as an index into per-span tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the following span id, or `None` on overflow.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Returns the blob cache key for this span.
    #[must_use]
    pub fn cache_key(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SpanId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// SHA-256 hash digest used for span verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(String);

impl Sha256Hash {
    /// Creates a hash from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid 64-character hex string.
    pub fn from_hex(hex: impl Into<String>) -> crate::error::Result<Self> {
        let hex = hex.into();
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(crate::error::LazyLayerError::Config {
                message: format!("invalid SHA-256 hex string: {hex}"),
            });
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Computes the digest of a byte slice.
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut hex = String::with_capacity(crate::constants::SHA256_HEX_LENGTH);
        for byte in hash {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Lifecycle state of a span.
///
/// Allowed edges: `Unrequested -> Requested`, `Requested -> Fetched`,
/// `Requested -> Uncompressed`, `Requested -> Unrequested` (failed fetch),
/// `Fetched -> Uncompressed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpanState {
    /// Nothing has been fetched for the span.
    Unrequested = 0,
    /// A caller holds the span lock and is fetching it.
    Requested = 1,
    /// The compressed bytes are in the cache.
    Fetched = 2,
    /// The decompressed bytes are in the cache.
    Uncompressed = 3,
}

impl SpanState {
    /// Returns whether `self -> to` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Unrequested, Self::Requested)
                | (Self::Requested, Self::Fetched | Self::Uncompressed | Self::Unrequested)
                | (Self::Fetched, Self::Uncompressed)
        )
    }

    /// Returns the `repr(u8)` tag.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a tag produced by [`SpanState::as_u8`].
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Unrequested),
            1 => Some(Self::Requested),
            2 => Some(Self::Fetched),
            3 => Some(Self::Uncompressed),
            _ => None,
        }
    }
}

impl fmt::Display for SpanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrequested => write!(f, "unrequested"),
            Self::Requested => write!(f, "requested"),
            Self::Fetched => write!(f, "fetched"),
            Self::Uncompressed => write!(f, "uncompressed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SpanState; 4] = [
        SpanState::Unrequested,
        SpanState::Requested,
        SpanState::Fetched,
        SpanState::Uncompressed,
    ];

    #[test]
    fn span_id_cache_key_is_decimal() {
        assert_eq!(SpanId::new(42).cache_key(), "42");
        assert_eq!(SpanId::new(0).to_string(), "0");
    }

    #[test]
    fn span_id_next_stops_at_overflow() {
        assert_eq!(SpanId::new(1).next(), Some(SpanId::new(2)));
        assert_eq!(SpanId::new(u32::MAX).next(), None);
    }

    #[test]
    fn sha256_of_empty_input() {
        let hash = Sha256Hash::digest(b"");
        assert_eq!(
            hash.as_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(hash.to_string().starts_with("sha256:"));
    }

    #[test]
    fn sha256_from_hex_rejects_garbage() {
        assert!(Sha256Hash::from_hex("abc").is_err());
        assert!(Sha256Hash::from_hex("z".repeat(64)).is_err());
        let upper = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        assert_eq!(
            Sha256Hash::from_hex(upper).expect("valid hex"),
            Sha256Hash::digest(b"")
        );
    }

    #[test]
    fn span_state_edges_match_lifecycle() {
        let allowed = [
            (SpanState::Unrequested, SpanState::Requested),
            (SpanState::Requested, SpanState::Fetched),
            (SpanState::Requested, SpanState::Uncompressed),
            (SpanState::Requested, SpanState::Unrequested),
            (SpanState::Fetched, SpanState::Uncompressed),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn span_state_tag_roundtrip() {
        for state in ALL {
            assert_eq!(SpanState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(SpanState::from_u8(9), None);
    }
}
