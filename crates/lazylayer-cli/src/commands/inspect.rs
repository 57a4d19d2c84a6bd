//! `llz inspect` — Show the checkpoints of a span index artifact.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use lazylayer_zinfo::{GzipIndex, LayerManifest, SpanIndex, manifest};

use crate::output::{format_bytes, short_digest};

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to the `.zinfo` artifact.
    pub index: PathBuf,
}

/// Executes the `inspect` command.
///
/// Digests are shown when the manifest exists next to the artifact.
///
/// # Errors
///
/// Returns an error if the artifact cannot be loaded.
pub fn execute(args: &InspectArgs) -> anyhow::Result<()> {
    let index = GzipIndex::load(&args.index)
        .with_context(|| format!("loading span index {}", args.index.display()))?;
    let manifest_path = manifest::manifest_path(&args.index);
    let layer_manifest = if manifest_path.exists() {
        let loaded = LayerManifest::load(&manifest_path)?;
        loaded.validate_against(&index)?;
        Some(loaded)
    } else {
        None
    };

    println!(
        "{} spans of {}",
        index.span_count(),
        format_bytes(index.span_size())
    );
    if let Some(m) = &layer_manifest {
        println!(
            "compressed {} / uncompressed {}",
            format_bytes(m.compressed_size),
            format_bytes(m.uncompressed_size)
        );
    }
    println!(
        "{:<6} {:>14} {:>4} {:>14} {:<12}",
        "SPAN", "COMPRESSED", "BITS", "UNCOMPRESSED", "DIGEST"
    );
    for checkpoint in index.checkpoints() {
        let digest = layer_manifest
            .as_ref()
            .and_then(|m| m.digest(checkpoint.span()))
            .map_or("-", |d| short_digest(d.as_hex()));
        println!(
            "{:<6} {:>14} {:>4} {:>14} {:<12}",
            checkpoint.span(),
            checkpoint.compressed_offset(),
            checkpoint.bits(),
            checkpoint.uncompressed_offset(),
            digest
        );
    }
    Ok(())
}
