use clap::Parser;
use std::path::PathBuf;

/// Concurrent chunk-based download/install engine for GOG depots.
#[derive(Clone, Parser)]
#[command(name = "gogdl")]
#[command(about = "Execute an install job: download, patch, and materialize a depot tree.")]
pub struct Cli {
    /// Install job (JSON): install path, manifest diff, secure links.
    #[arg(value_name = "JOB")]
    pub job: PathBuf,

    /// Download worker threads. Default: from `.gogdl.toml` in the install
    /// path, else 4.
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Support-tree destination. Default: `gog-support` inside the install
    /// path.
    #[arg(long)]
    pub support: Option<PathBuf>,

    /// Verbose output. Default: false.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
