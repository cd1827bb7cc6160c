//! Gogdl CLI: execute an install job produced by the manifest layer.

use anyhow::Result;
use clap::Parser;
use gogdl::engine::Cli;
use gogdl::engine::handle_install;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    handle_install(&cli)?;

    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
