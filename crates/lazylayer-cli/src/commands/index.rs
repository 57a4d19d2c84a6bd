//! `llz index` — Build the span index and manifest of a gzip layer.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use lazylayer_common::config::LazyLayerConfig;
use lazylayer_common::constants::ZINFO_EXTENSION;
use lazylayer_zinfo::{SpanIndex, manifest};

use crate::output::{format_bytes, format_ratio};

/// Arguments for the `index` command.
#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Path to the gzip-compressed layer.
    pub layer: PathBuf,

    /// Uncompressed bytes per span; overrides the configuration.
    #[arg(long)]
    pub span_size: Option<u64>,

    /// Output prefix; `PREFIX.zinfo` and `PREFIX.zinfo.json` are written.
    #[arg(short, long, value_name = "PREFIX")]
    pub output: Option<PathBuf>,
}

/// Executes the `index` command.
///
/// # Errors
///
/// Returns an error if the layer cannot be indexed or the artifacts
/// cannot be written.
pub fn execute(args: IndexArgs, config: &LazyLayerConfig) -> anyhow::Result<()> {
    let span_size = args.span_size.unwrap_or(config.span_size);
    let index_path = match args.output {
        Some(prefix) => {
            let mut path = prefix.into_os_string();
            path.push(".");
            path.push(ZINFO_EXTENSION);
            PathBuf::from(path)
        }
        None => super::default_index_path(&args.layer),
    };

    let (index, layer_manifest) = lazylayer_zinfo::index_file(&args.layer, span_size)
        .with_context(|| format!("indexing {}", args.layer.display()))?;
    index.save(&index_path)?;
    let manifest_path = manifest::manifest_path(&index_path);
    layer_manifest.save(&manifest_path)?;
    tracing::info!(
        index = %index_path.display(),
        manifest = %manifest_path.display(),
        "wrote layer artifacts"
    );

    println!("Layer:        {}", args.layer.display());
    println!(
        "Compressed:   {} ({} bytes)",
        format_bytes(layer_manifest.compressed_size),
        layer_manifest.compressed_size
    );
    println!(
        "Uncompressed: {} ({} bytes, {})",
        format_bytes(layer_manifest.uncompressed_size),
        layer_manifest.uncompressed_size,
        format_ratio(layer_manifest.compressed_size, layer_manifest.uncompressed_size)
    );
    println!(
        "Spans:        {} of {}",
        index.span_count(),
        format_bytes(index.span_size())
    );
    println!("Index:        {}", index_path.display());
    println!("Manifest:     {}", manifest_path.display());
    Ok(())
}
