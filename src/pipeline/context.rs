//! Channel bundle and shared state for one executor run.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::engine::tasks::{
    DownloadMessage, DownloadTaskResult, WriterFeedback, WriterMessage,
};
use crate::utils::config::PackagePaths;

/// Destination roots and bookkeeping files for one install target.
#[derive(Clone, Debug)]
pub struct InstallPaths {
    /// Install root; relative manifest paths resolve against it.
    pub root: PathBuf,
    /// Support-tree root (`SUPPORT`-flagged entries land here).
    pub support: PathBuf,
    /// Chunk-cache directory for shared chunks.
    pub cache: PathBuf,
    /// Resume journal, deleted only on a clean finish.
    pub resume_file: PathBuf,
}

impl InstallPaths {
    pub fn new(root: &Path, support_override: Option<&Path>) -> Self {
        let paths = PackagePaths::get();
        Self {
            root: root.to_path_buf(),
            support: support_override
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.join(paths.support_dir_name())),
            cache: root.join(paths.cache_dir_name()),
            resume_file: root.join(paths.resume_filename()),
        }
    }
}

/// Every queue the executor wires between its coordinators and workers.
/// The two unit-token channels stand in for the source's condition
/// variables: bounded(1), so pending notifications coalesce.
pub struct ExecutorChannels {
    pub download_tx: Sender<DownloadMessage>,
    pub download_rx: Receiver<DownloadMessage>,
    pub download_res_tx: Sender<DownloadTaskResult>,
    pub download_res_rx: Receiver<DownloadTaskResult>,
    pub writer_tx: Sender<WriterMessage>,
    pub writer_rx: Receiver<WriterMessage>,
    pub writer_res_tx: Sender<WriterFeedback>,
    pub writer_res_rx: Receiver<WriterFeedback>,
    pub download_speed_tx: Sender<(u64, u64)>,
    pub download_speed_rx: Receiver<(u64, u64)>,
    pub writer_speed_tx: Sender<(u64, u64)>,
    pub writer_speed_rx: Receiver<(u64, u64)>,
    /// Signals the scheduler that a download result landed (task-ready).
    pub task_ready_tx: Sender<()>,
    pub task_ready_rx: Receiver<()>,
    /// Signals the scheduler that a scratch slot was freed.
    pub scratch_ready_tx: Sender<()>,
    pub scratch_ready_rx: Receiver<()>,
}

pub fn create_executor_channels() -> ExecutorChannels {
    let (download_tx, download_rx) = unbounded();
    let (download_res_tx, download_res_rx) = unbounded();
    let (writer_tx, writer_rx) = unbounded();
    let (writer_res_tx, writer_res_rx) = unbounded();
    let (download_speed_tx, download_speed_rx) = unbounded();
    let (writer_speed_tx, writer_speed_rx) = unbounded();
    let (task_ready_tx, task_ready_rx) = bounded(1);
    let (scratch_ready_tx, scratch_ready_rx) = bounded(1);
    ExecutorChannels {
        download_tx,
        download_rx,
        download_res_tx,
        download_res_rx,
        writer_tx,
        writer_rx,
        writer_res_tx,
        writer_res_rx,
        download_speed_tx,
        download_speed_rx,
        writer_speed_tx,
        writer_speed_rx,
        task_ready_tx,
        task_ready_rx,
        scratch_ready_tx,
        scratch_ready_rx,
    }
}

/// Wake a waiter without blocking; a full signal channel already wakes it.
pub fn notify(tx: &Sender<()>) {
    let _ = tx.try_send(());
}

/// Run-wide flags and counters shared by the coordinator loops.
#[derive(Default)]
pub struct ExecutorShared {
    running: AtomicBool,
    fatal_error: AtomicBool,
    /// Chunks submitted to workers and not yet routed to the writer.
    active_chunks: AtomicUsize,
    /// Writer results seen so far; the run is done when this reaches the
    /// plan's task count.
    processed_items: AtomicUsize,
}

impl ExecutorShared {
    pub fn new() -> Self {
        let shared = Self::default();
        shared.running.store(true, Ordering::SeqCst);
        shared
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn fatal(&self) -> bool {
        self.fatal_error.load(Ordering::SeqCst)
    }

    pub fn set_fatal(&self) {
        self.fatal_error.store(true, Ordering::SeqCst);
    }

    pub fn active_chunks(&self) -> usize {
        self.active_chunks.load(Ordering::SeqCst)
    }

    pub fn chunk_submitted(&self) {
        self.active_chunks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn chunk_routed(&self) {
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn processed_items(&self) -> usize {
        self.processed_items.load(Ordering::SeqCst)
    }

    pub fn item_processed(&self) {
        self.processed_items.fetch_add(1, Ordering::SeqCst);
    }
}
