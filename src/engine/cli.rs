//! CLI command handler: load the job file, wire cancellation, run the engine.

use anyhow::{Context, Result, bail};
use log::info;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::arg_parser::Cli;
use crate::engine::progress::{LogReporter, ProgressReporter};
use crate::pipeline::orchestrator::Executor;
use crate::types::{Diff, InstallOpts, SecureLinks};
use crate::utils::gogdl_toml::{apply_file_to_opts, load_gogdl_toml};
use crate::utils::setup_logging;

/// Everything one run needs, as produced by the manifest layer.
#[derive(Debug, Deserialize)]
pub struct InstallJob {
    /// Install root.
    pub path: PathBuf,
    #[serde(default)]
    pub support_path: Option<PathBuf>,
    #[serde(default)]
    pub workers: Option<usize>,
    pub diff: Diff,
    pub secure_links: SecureLinks,
}

/// Merge options: `.gogdl.toml` in the install root first, then the job
/// file, then CLI flags.
fn setup_opts(cli: &Cli, job: &InstallJob) -> InstallOpts {
    let mut opts = InstallOpts::default();
    let mut verbose = cli.verbose;
    if let Some(file) = load_gogdl_toml(&job.path)
        && let Some(file_verbose) = apply_file_to_opts(&file, &mut opts)
    {
        verbose = verbose || file_verbose;
    }
    if let Some(workers) = job.workers {
        opts.workers = workers.max(1);
    }
    if let Some(workers) = cli.workers {
        opts.workers = workers.max(1);
    }
    if let Some(support) = cli.support.clone().or_else(|| job.support_path.clone()) {
        opts.support_path = Some(support);
    }
    setup_logging(verbose);
    opts
}

/// Run the install job. A fatal run leaves the resume journal behind so the
/// next invocation picks up where this one stopped.
pub fn handle_install(cli: &Cli) -> Result<()> {
    let text = fs::read_to_string(&cli.job)
        .with_context(|| format!("read install job {}", cli.job.display()))?;
    let job: InstallJob = serde_json::from_str(&text).context("parse install job")?;
    let opts = setup_opts(cli, &job);

    let cancel = setup_ctrlc_handler()?;
    let reporter: Arc<dyn ProgressReporter> = Arc::new(LogReporter);
    let executor = Executor::new(
        &job.path,
        job.diff,
        job.secure_links,
        opts,
        reporter,
        None,
        cancel,
    );
    if executor.run()? {
        bail!("installation did not complete; run again to resume");
    }
    info!("installation complete");
    Ok(())
}

/// Setup Ctrl+C handler and return the shared cancellation flag every worker
/// and coordinator polls.
pub fn setup_ctrlc_handler() -> Result<Arc<AtomicBool>> {
    let cancel_requested = Arc::new(AtomicBool::new(false));
    let cancel_handler = Arc::clone(&cancel_requested);

    ctrlc::set_handler(move || {
        cancel_handler.store(true, Ordering::Relaxed);
    })
    .context("set Ctrl+C handler")?;
    Ok(cancel_requested)
}
