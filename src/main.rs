//! infernofs - patch a dyld shared cache for GPU-less software rendering.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use infernofs::RunOptions;

/// Patches a dyld shared cache so software rendering becomes
/// authoritative.
#[derive(Parser, Debug)]
#[command(name = "infernofs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the main dyld shared cache file
    cache: PathBuf,

    /// Revert bytes to the original state, without reapplying patches
    #[arg(short, long, conflicts_with = "dry_run")]
    revert: bool,

    /// Revert bytes and build patches, but do not apply the modifications
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Patch libsystem_trace.dylib to unredact logs
    #[arg(long)]
    unredact_logs: bool,

    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "2")]
    verbosity: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    let options = RunOptions {
        revert_only: cli.revert,
        dry_run: cli.dry_run,
        unredact_logs: cli.unredact_logs,
    };

    infernofs::run(&cli.cache, &options)
        .with_context(|| format!("failed to patch cache: {}", cli.cache.display()))
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}
