//! # llz — lazylayer developer tool
//!
//! Builds span index artifacts for gzip layers and reads layers through
//! the same span manager and background fetcher a lazy mount uses.

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli)
}
