//! Gogdl: concurrent chunk-based download/install engine for GOG depots.
//!
//! Given a manifest diff and a table of signed CDN links, the engine plans
//! an ordered task stream and executes it with a pool of download workers
//! feeding a single writer: files are materialized byte-exactly, repeated
//! chunks are deduplicated through an on-disk cache, interrupted runs resume
//! from a journal of verified files, and deltas are applied through a
//! caller-supplied patcher.

pub mod engine;
pub mod patch;
pub mod pipeline;
pub mod types;
pub mod utils;
pub mod workers;

/// Re-export the data model for API users
pub use types::*;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use engine::progress::{LogReporter, ProgressReporter};
use patch::Patcher;
use pipeline::orchestrator::Executor;

/// Single entry point: execute `diff` against the tree at `root`.
///
/// - **`reporter: None`** → progress is logged (see [`LogReporter`]); pass
///   your own [`ProgressReporter`] to drive a UI.
/// - **`patcher: None`** → plans containing patch-diff entries fail at the
///   `PATCH` task; supply a [`Patcher`] when the diff carries deltas.
///
/// `cancel` is polled by every worker and coordinator; setting it stops the
/// run and leaves the resume journal in place. Returns `Ok(true)` when the
/// run ended fatally (resumable), `Ok(false)` on a clean finish.
pub fn install(
    root: &Path,
    diff: Diff,
    secure_links: SecureLinks,
    opts: &InstallOpts,
    reporter: Option<Arc<dyn ProgressReporter>>,
    patcher: Option<Arc<dyn Patcher>>,
    cancel: Arc<AtomicBool>,
) -> Result<bool> {
    let reporter = reporter.unwrap_or_else(|| Arc::new(LogReporter));
    Executor::new(root, diff, secure_links, opts.clone(), reporter, patcher, cancel).run()
}
