//! Nether Modinfo - inspect legacy tracker modules
//!
//! # Commands
//!
//! - `nether-modinfo identify <files>...` - Report which loader recognizes each file
//! - `nether-modinfo info <file>` - Load a module and print its header, orders and samples
//! - `nether-modinfo dump <file>` - Print the unified track events of every pattern
//!
//! # Loader Options
//!
//! `info` and `dump` accept `--config loader.toml`:
//!
//! ```toml
//! curious = true        # keep orders past the first end marker
//! dedup_tracks = false  # give every (pattern, channel) its own track
//! max_channels = 32
//! ibm850_names = false  # decode names as Latin-1
//! ```
//!
//! Command-line flags override the file. Set `RUST_LOG=debug` to follow the loaders.

mod config;
mod dump;
mod identify;
mod info;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Nether Modinfo - inspect legacy tracker modules
#[derive(Parser)]
#[command(name = "nether-modinfo")]
#[command(about = "Inspect legacy tracker modules")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report which loader recognizes each file
    Identify(identify::IdentifyArgs),

    /// Load a module and print its header, orders and samples
    Info(info::InfoArgs),

    /// Print the unified track events of a module
    Dump(dump::DumpArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identify(args) => identify::execute(args),
        Commands::Info(args) => info::execute(args),
        Commands::Dump(args) => dump::execute(args),
    }
}
