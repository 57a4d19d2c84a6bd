//! CLI command definitions and dispatch.

pub mod cat;
pub mod index;
pub mod inspect;
pub mod prefetch;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lazylayer_common::config::LazyLayerConfig;
use lazylayer_common::constants::{BIN_NAME, ZINFO_EXTENSION};
use lazylayer_common::metrics::MetricsSink;
use lazylayer_span::cache::DirectoryCache;
use lazylayer_span::reader::FileReader;
use lazylayer_span::{SpanManager, SpanManagerBuilder};
use lazylayer_zinfo::{GzipIndex, LayerManifest, manifest};

/// llz — random access into gzip-compressed image layers.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file; built-in defaults when omitted.
    #[arg(long, global = true, env = "LAZYLAYER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the span index and manifest of a gzip layer.
    Index(index::IndexArgs),
    /// Show the checkpoints of a span index artifact.
    Inspect(inspect::InspectArgs),
    /// Print an uncompressed byte range of a layer.
    Cat(cat::CatArgs),
    /// Fetch every span of a layer through the background fetcher.
    Prefetch(prefetch::PrefetchArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => LazyLayerConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => LazyLayerConfig::default(),
    };
    match cli.command {
        Command::Index(args) => index::execute(args, &config),
        Command::Inspect(args) => inspect::execute(&args),
        Command::Cat(args) => cat::execute(args, &config),
        Command::Prefetch(args) => prefetch::execute(args, &config),
    }
}

/// Index artifact path used when none is given: `layer.tar.gz` maps to
/// `layer.tar.zinfo`.
pub fn default_index_path(layer: &Path) -> PathBuf {
    layer.with_extension(ZINFO_EXTENSION)
}

/// Layer arguments shared by commands that read through a span manager.
#[derive(clap::Args, Debug)]
pub struct LayerArgs {
    /// Path to the gzip-compressed layer.
    pub layer: PathBuf,

    /// Span index artifact; defaults to the layer path with a `.zinfo`
    /// extension.
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Keep span bytes in this directory instead of memory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

impl LayerArgs {
    /// Loads the artifacts of the layer and builds its span manager.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact or the layer cannot be opened or
    /// they do not describe the same layer.
    pub fn open_manager(
        &self,
        config: &LazyLayerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> anyhow::Result<SpanManager> {
        let index_path = self
            .index
            .clone()
            .unwrap_or_else(|| default_index_path(&self.layer));
        let index = GzipIndex::load(&index_path)
            .with_context(|| format!("loading span index {}", index_path.display()))?;
        let manifest_path = manifest::manifest_path(&index_path);
        let layer_manifest = LayerManifest::load(&manifest_path)
            .with_context(|| format!("loading manifest {}", manifest_path.display()))?;
        let reader = FileReader::open(&self.layer)?;

        let mut builder =
            SpanManagerBuilder::from_manifest(Arc::new(index), &layer_manifest, Arc::new(reader))?
                .config(&config.span_manager)
                .metrics(metrics);
        if let Some(dir) = &self.cache_dir {
            builder = builder.cache(Arc::new(DirectoryCache::open(dir.clone())?));
        }
        Ok(builder.build()?)
    }
}

/// Runs `future` to completion on a fresh multi-threaded runtime.
///
/// # Errors
///
/// Returns an error if the runtime cannot be created.
pub fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_index_path_replaces_last_extension() {
        assert_eq!(
            default_index_path(Path::new("/layers/base.tar.gz")),
            PathBuf::from("/layers/base.tar.zinfo")
        );
    }

    #[test]
    fn parses_cat_with_global_config() {
        let cli = Cli::try_parse_from([
            "llz", "cat", "layer.tar.gz", "--offset", "10", "--length", "20", "--config", "c.json",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
        match cli.command {
            Command::Cat(args) => {
                assert_eq!(args.offset, 10);
                assert_eq!(args.length, Some(20));
                assert_eq!(args.layer.layer, PathBuf::from("layer.tar.gz"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
