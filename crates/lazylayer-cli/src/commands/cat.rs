//! `llz cat` — Print an uncompressed byte range of a layer.

use std::io::Write;
use std::sync::Arc;

use clap::Args;
use lazylayer_common::config::LazyLayerConfig;
use lazylayer_common::metrics::NoopMetrics;

use super::LayerArgs;

/// Arguments for the `cat` command.
#[derive(Args, Debug)]
pub struct CatArgs {
    /// Layer and artifact locations.
    #[command(flatten)]
    pub layer: LayerArgs,

    /// First uncompressed byte to print.
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Number of bytes to print; up to the end of the layer when omitted.
    #[arg(long)]
    pub length: Option<u64>,
}

/// Executes the `cat` command.
///
/// Only the spans overlapping the range are fetched and decompressed.
///
/// # Errors
///
/// Returns an error if the range is outside of the layer or a span cannot
/// be read.
pub fn execute(args: CatArgs, config: &LazyLayerConfig) -> anyhow::Result<()> {
    let manager = args.layer.open_manager(config, Arc::new(NoopMetrics))?;
    let end = match args.length {
        Some(length) => args.offset.saturating_add(length),
        None => manager.uncompressed_size(),
    };
    let mut contents = super::block_on(manager.get_contents(args.offset, end))??;
    manager.close()?;

    let mut stdout = std::io::stdout().lock();
    let _ = std::io::copy(&mut contents, &mut stdout)?;
    stdout.flush()?;
    Ok(())
}
