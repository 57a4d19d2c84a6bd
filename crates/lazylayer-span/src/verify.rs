//! Verification of fetched compressed span bytes.

use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::types::{Sha256Hash, SpanId};
use lazylayer_zinfo::LayerManifest;

/// Checks compressed span bytes before they are cached.
pub trait SpanVerifier: Send + Sync {
    /// Verifies the compressed bytes of `span`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::DigestMismatch` if the bytes are not the
    /// expected ones. The span manager retries only this error.
    fn verify(&self, span: SpanId, compressed: &[u8]) -> Result<()>;
}

/// Verifier comparing SHA-256 digests against a per-span table.
#[derive(Debug, Clone)]
pub struct DigestVerifier {
    digests: Vec<Sha256Hash>,
}

impl DigestVerifier {
    /// Creates a verifier from digests in span order.
    #[must_use]
    pub const fn new(digests: Vec<Sha256Hash>) -> Self {
        Self { digests }
    }

    /// Creates a verifier expecting the digests of `manifest`.
    #[must_use]
    pub fn from_manifest(manifest: &LayerManifest) -> Self {
        Self::new(manifest.span_digests.clone())
    }
}

impl SpanVerifier for DigestVerifier {
    fn verify(&self, span: SpanId, compressed: &[u8]) -> Result<()> {
        let expected = self
            .digests
            .get(span.index())
            .ok_or_else(|| LazyLayerError::ExceedsMaxSpan {
                span,
                max_span: u32::try_from(self.digests.len())
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .map(SpanId::new),
            })?;
        let actual = Sha256Hash::digest(compressed);
        if &actual != expected {
            return Err(LazyLayerError::DigestMismatch {
                span,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_digest_passes() {
        let verifier = DigestVerifier::new(vec![
            Sha256Hash::digest(b"span zero"),
            Sha256Hash::digest(b"span one"),
        ]);
        verifier.verify(SpanId::new(1), b"span one").expect("verified");
    }

    #[test]
    fn mismatch_reports_both_digests() {
        let verifier = DigestVerifier::new(vec![Sha256Hash::digest(b"expected")]);
        let err = verifier
            .verify(SpanId::new(0), b"tampered")
            .expect_err("mismatch");
        assert!(err.is_digest_mismatch());
        let message = err.to_string();
        assert!(message.contains(&Sha256Hash::digest(b"expected").to_string()));
        assert!(message.contains(&Sha256Hash::digest(b"tampered").to_string()));
    }

    #[test]
    fn unknown_span_exceeds_table() {
        let verifier = DigestVerifier::new(vec![Sha256Hash::digest(b"only")]);
        assert!(matches!(
            verifier.verify(SpanId::new(1), b"only"),
            Err(LazyLayerError::ExceedsMaxSpan {
                max_span: Some(max),
                ..
            }) if max == SpanId::new(0)
        ));
    }
}
