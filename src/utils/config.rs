//! Tuning constants and package-derived file names.
//! Sizing, deadlines, and on-disk naming in one place.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    resume_filename: String,
    cache_dir_name: String,
    scratch_prefix: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                resume_filename: format!(".{pkg}-resume"),
                cache_dir_name: format!(".{pkg}-download-cache"),
                scratch_prefix: format!("{pkg}_"),
            }
        })
    }

    /// Resume-journal file name inside the install root (`.gogdl-resume`).
    pub fn resume_filename(&self) -> &str {
        &self.resume_filename
    }

    /// Chunk-cache directory name inside the install root
    /// (`.gogdl-download-cache`).
    pub fn cache_dir_name(&self) -> &str {
        &self.cache_dir_name
    }

    /// Prefix of the process-private scratch directory (`gogdl_`).
    pub fn scratch_prefix(&self) -> &str {
        &self.scratch_prefix
    }

    /// Default support-tree directory name inside the install root.
    pub fn support_dir_name(&self) -> &'static str {
        "gog-support"
    }
}

// ---- Downloader ----

/// Download worker tuning.
pub struct DownloadConsts;

impl DownloadConsts {
    /// Attempts per chunk inside one worker before it reports failure.
    pub const RETRIES: u32 = 5;
    /// Pause between attempts.
    pub const RETRY_PAUSE: Duration = Duration::from_secs(2);
    /// HTTP socket timeout.
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
    /// Streamed read slice size.
    pub const STREAM_CHUNK_SIZE: usize = 512 * 1024;
    /// Re-enqueues of one failed chunk by the orchestrator before the run
    /// aborts instead of live-locking.
    pub const MAX_CHUNK_REQUEUES: u32 = 3;
}

// ---- V1 split sizing ----

/// V1 files are split into ranged chunks sized from the biggest V2 chunk
/// observed in the same diff.
pub struct ChunkConsts;

impl ChunkConsts {
    /// Split size when the diff carries no V2 chunks at all.
    pub const DEFAULT_SPLIT: u64 = 20 * 1024 * 1024;
    /// Floor applied to the observed biggest chunk.
    pub const MIN_SPLIT: u64 = 10 * 1024 * 1024;
}

// ---- Executor ----

/// Executor sizing and shutdown deadlines.
pub struct ExecutorConsts;

impl ExecutorConsts {
    /// Scratch slots per download worker (hard in-flight bound).
    pub const SCRATCH_PER_WORKER: usize = 4;
    /// Soft bound: scheduler stops submitting past `2 × workers` active
    /// chunks.
    pub const ACTIVE_PER_WORKER: usize = 2;
    /// Wait on the task-ready / scratch-ready signals.
    pub const COND_WAIT: Duration = Duration::from_secs(1);
    /// Wait on result queues (keeps cancellation observable).
    pub const QUEUE_WAIT: Duration = Duration::from_secs(1);
    /// Writer-side queue wait.
    pub const WRITER_QUEUE_WAIT: Duration = Duration::from_secs(2);
    /// Main-loop poll interval.
    pub const MAIN_POLL: Duration = Duration::from_millis(250);
    /// Join deadline per download worker on orderly shutdown.
    pub const DOWNLOAD_JOIN: Duration = Duration::from_secs(2);
    /// Join deadline for the writer on orderly shutdown.
    pub const WRITER_JOIN: Duration = Duration::from_secs(10);
    /// Join deadline on interrupt shutdown.
    pub const INTERRUPT_JOIN: Duration = Duration::from_secs(5);
    /// Download workers when neither the caller nor `.gogdl.toml` picked one.
    pub const DEFAULT_WORKERS: usize = 4;
}

// ---- Writer ----

/// Writer I/O sizing.
pub struct WriterConsts;

impl WriterConsts {
    /// Copy slice for scratch/old-file reads.
    pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;
}

// ---- Progress ----

/// Speed-meter tuning.
pub struct ProgressConsts;

impl ProgressConsts {
    /// Interval between rate snapshots handed to the reporter.
    pub const SPEED_WINDOW: Duration = Duration::from_secs(1);
}
