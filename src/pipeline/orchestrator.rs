//! Executor orchestrator: spawns the download pool and the writer, runs the
//! three coordinator loops (scheduler, task-advance, writer-results), and
//! owns shutdown and cancellation.

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::planner::{Plan, V1DownloadSpec, V2DownloadSpec, build_plan};
use crate::engine::progress::{ProgressReporter, speed_meter_loop};
use crate::engine::tasks::{
    ChunkTask, DownloadMessage, DownloadTask, DownloadTaskResult, FailReason, Task, TaskFlag,
    V1Download, V1Task, V2Download, WriterFeedback, WriterMessage, WriterTask,
};
use crate::patch::Patcher;
use crate::pipeline::context::{
    ExecutorChannels, ExecutorShared, InstallPaths, create_executor_channels, notify,
};
use crate::pipeline::scratch::ScratchPool;
use crate::types::{Diff, InstallOpts, SecureLinks};
use crate::utils::config::{DownloadConsts, ExecutorConsts};
use crate::utils::free_space::check_free_space;
use crate::utils::paths::{prepare_location, readable_size};
use crate::workers::{download_worker, writer_worker};

/// One install/update run: plans the diff, then drives the concurrent
/// download/write pipeline until the plan is drained, a fatal error lands,
/// or the cancel flag is raised.
pub struct Executor {
    diff: Diff,
    secure_links: Arc<SecureLinks>,
    paths: InstallPaths,
    opts: InstallOpts,
    reporter: Arc<dyn ProgressReporter>,
    patcher: Option<Arc<dyn Patcher>>,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        root: &Path,
        diff: Diff,
        secure_links: SecureLinks,
        opts: InstallOpts,
        reporter: Arc<dyn ProgressReporter>,
        patcher: Option<Arc<dyn Patcher>>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let paths = InstallPaths::new(root, opts.support_path.as_deref());
        Self {
            diff,
            secure_links: Arc::new(secure_links),
            paths,
            opts,
            reporter,
            patcher,
            cancel,
        }
    }

    /// Plan and execute. `Ok(false)` on a clean finish (resume journal
    /// removed); `Ok(true)` when the run hit a fatal error or was cancelled
    /// (journal left in place for the next attempt). `Err` means the run
    /// refused to start and touched nothing.
    pub fn run(&self) -> Result<bool> {
        let workers = self.opts.workers.max(1);
        prepare_location(&self.paths.root)
            .with_context(|| format!("prepare install root {}", self.paths.root.display()))?;

        let plan = build_plan(&self.diff, &self.paths);
        if !check_free_space(plan.required_disk_size_delta, &self.paths.root) {
            bail!(
                "not enough free space at {} ({} required)",
                self.paths.root.display(),
                readable_size(plan.required_disk_size_delta.max(0) as u64)
            );
        }
        let items_to_complete = plan.items_to_complete();
        if items_to_complete == 0 {
            info!("nothing to do");
            self.remove_resume_journal();
            return Ok(false);
        }

        let scratch = Arc::new(ScratchPool::new(workers * ExecutorConsts::SCRATCH_PER_WORKER)?);
        debug!("scratch directory: {}", scratch.dir().display());
        let ch = create_executor_channels();
        let shared = Arc::new(ExecutorShared::new());

        let Plan { tasks, v1_downloads, v2_downloads, hash_map, .. } = plan;
        let hash_map = Arc::new(hash_map);

        info!("starting {workers} download workers");
        let mut download_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = ch.download_rx.clone();
            let res_tx = ch.download_res_tx.clone();
            let speed_tx = ch.download_speed_tx.clone();
            let links = Arc::clone(&self.secure_links);
            let cancel = Arc::clone(&self.cancel);
            download_handles.push(thread::spawn(move || {
                download_worker(rx, res_tx, speed_tx, links, cancel)
            }));
        }
        let writer_handle = {
            let rx = ch.writer_rx.clone();
            let res_tx = ch.writer_res_tx.clone();
            let speed_tx = ch.writer_speed_tx.clone();
            let cache = self.paths.cache.clone();
            let patcher = self.patcher.clone();
            let cancel = Arc::clone(&self.cancel);
            thread::spawn(move || writer_worker(rx, res_tx, speed_tx, cache, patcher, cancel))
        };

        let meter_running = Arc::new(AtomicBool::new(true));
        let meter_handle = {
            let download_speed_rx = ch.download_speed_rx.clone();
            let writer_speed_rx = ch.writer_speed_rx.clone();
            let reporter = Arc::clone(&self.reporter);
            let running = Arc::clone(&meter_running);
            thread::spawn(move || {
                speed_meter_loop(download_speed_rx, writer_speed_rx, reporter, running)
            })
        };

        let scheduler_handle = {
            let scratch = Arc::clone(&scratch);
            let download_tx = ch.download_tx.clone();
            let task_ready_rx = ch.task_ready_rx.clone();
            let scratch_ready_rx = ch.scratch_ready_rx.clone();
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                scheduler_loop(
                    v1_downloads,
                    v2_downloads,
                    scratch,
                    download_tx,
                    task_ready_rx,
                    scratch_ready_rx,
                    shared,
                    workers,
                )
            })
        };
        let task_handle = {
            let download_res_rx = ch.download_res_rx.clone();
            let download_tx = ch.download_tx.clone();
            let writer_tx = ch.writer_tx.clone();
            let task_ready_tx = ch.task_ready_tx.clone();
            let shared = Arc::clone(&shared);
            let reporter = Arc::clone(&self.reporter);
            let paths = self.paths.clone();
            thread::spawn(move || {
                task_advance_loop(
                    tasks,
                    download_res_rx,
                    download_tx,
                    writer_tx,
                    task_ready_tx,
                    shared,
                    reporter,
                    paths,
                )
            })
        };
        let writer_result_handle = {
            let writer_res_rx = ch.writer_res_rx.clone();
            let scratch = Arc::clone(&scratch);
            let scratch_ready_tx = ch.scratch_ready_tx.clone();
            let shared = Arc::clone(&shared);
            let reporter = Arc::clone(&self.reporter);
            let hash_map = Arc::clone(&hash_map);
            let resume_file = self.paths.resume_file.clone();
            thread::spawn(move || {
                writer_result_loop(
                    writer_res_rx,
                    scratch,
                    scratch_ready_tx,
                    shared,
                    reporter,
                    hash_map,
                    resume_file,
                )
            })
        };
        let coordinators = vec![
            ("scheduler", scheduler_handle),
            ("task collector", task_handle),
            ("writer collector", writer_result_handle),
        ];

        let mut interrupted = false;
        while shared.processed_items() < items_to_complete && !shared.fatal() {
            if self.cancel.load(Ordering::Relaxed) {
                info!("cancellation requested");
                shared.set_fatal();
                interrupted = true;
                break;
            }
            thread::sleep(ExecutorConsts::MAIN_POLL);
        }

        if interrupted {
            self.interrupt_shutdown(&ch, shared, meter_running, coordinators, download_handles, writer_handle, meter_handle);
            return Ok(true);
        }

        debug!("sending terminate instruction to workers");
        for _ in 0..workers {
            let _ = ch.download_tx.send(DownloadMessage::Terminate);
        }
        let _ = ch.writer_tx.send(WriterMessage::Terminate);
        for handle in download_handles {
            join_with_deadline(handle, ExecutorConsts::DOWNLOAD_JOIN, "download worker");
        }
        join_with_deadline(writer_handle, ExecutorConsts::WRITER_JOIN, "writer");

        shared.stop();
        meter_running.store(false, Ordering::Relaxed);
        notify(&ch.task_ready_tx);
        notify(&ch.scratch_ready_tx);
        for (name, handle) in coordinators {
            join_with_deadline(handle, ExecutorConsts::DOWNLOAD_JOIN, name);
        }
        join_with_deadline(meter_handle, ExecutorConsts::DOWNLOAD_JOIN, "speed meter");

        let fatal = shared.fatal();
        if !fatal {
            self.remove_resume_journal();
        }
        Ok(fatal)
    }

    /// Cancellation path: stop the loops, join with the shorter deadline,
    /// and leave the resume journal in place for the next run.
    #[allow(clippy::too_many_arguments)]
    fn interrupt_shutdown(
        &self,
        ch: &ExecutorChannels,
        shared: Arc<ExecutorShared>,
        meter_running: Arc<AtomicBool>,
        coordinators: Vec<(&'static str, JoinHandle<()>)>,
        download_handles: Vec<JoinHandle<()>>,
        writer_handle: JoinHandle<()>,
        meter_handle: JoinHandle<()>,
    ) {
        shared.stop();
        meter_running.store(false, Ordering::Relaxed);
        notify(&ch.task_ready_tx);
        notify(&ch.scratch_ready_tx);
        for (name, handle) in coordinators {
            join_with_deadline(handle, ExecutorConsts::INTERRUPT_JOIN, name);
        }
        for handle in download_handles {
            join_with_deadline(handle, ExecutorConsts::INTERRUPT_JOIN, "download worker");
        }
        join_with_deadline(writer_handle, ExecutorConsts::INTERRUPT_JOIN, "writer");
        join_with_deadline(meter_handle, ExecutorConsts::INTERRUPT_JOIN, "speed meter");
    }

    fn remove_resume_journal(&self) {
        if self.paths.resume_file.exists()
            && let Err(e) = fs::remove_file(&self.paths.resume_file)
        {
            error!("failed to remove resume journal: {e}");
        }
    }
}

/// Join `handle` or abandon it after `deadline`. Abandoned workers leave
/// scratch bytes behind; the scratch-directory teardown collects them.
fn join_with_deadline(handle: JoinHandle<()>, deadline: Duration, name: &str) {
    let start = Instant::now();
    while !handle.is_finished() && start.elapsed() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("{name} did not terminate in time, abandoning");
    }
}

/// Download scheduler: marries queued chunk fetches to free scratch slots,
/// throttling on the soft in-flight bound and on scratch exhaustion.
#[allow(clippy::too_many_arguments)]
fn scheduler_loop(
    mut v1: VecDeque<V1DownloadSpec>,
    mut v2: VecDeque<V2DownloadSpec>,
    scratch: Arc<ScratchPool>,
    download_tx: Sender<DownloadMessage>,
    task_ready_rx: Receiver<()>,
    scratch_ready_rx: Receiver<()>,
    shared: Arc<ExecutorShared>,
    workers: usize,
) {
    debug!("download scheduler starting");
    let soft_limit = workers * ExecutorConsts::ACTIVE_PER_WORKER;
    while shared.running() {
        let mut no_scratch = false;
        while shared.active_chunks() <= soft_limit && !(v1.is_empty() && v2.is_empty()) {
            let Some(slot) = scratch.try_acquire() else {
                no_scratch = true;
                break;
            };
            if let Some(spec) = v1.pop_front() {
                let task = DownloadTask::v1(V1Download {
                    product_id: spec.product_id.clone(),
                    offset: spec.offset,
                    size: spec.size,
                    chunk_id: spec.chunk_id.clone(),
                    scratch: slot,
                });
                debug!("submitting v1 range {} ({} bytes)", spec.chunk_id, spec.size);
                match download_tx.send(DownloadMessage::Task(task)) {
                    Ok(()) => shared.chunk_submitted(),
                    Err(SendError(msg)) => {
                        warn!("failed to push v1 task to download");
                        reclaim_slot(&scratch, msg);
                        v1.push_front(spec);
                        break;
                    }
                }
            } else if let Some(spec) = v2.pop_front() {
                let task = DownloadTask::v2(V2Download {
                    product_id: spec.product_id.clone(),
                    compressed_md5: spec.compressed_md5.clone(),
                    scratch: slot,
                });
                debug!("submitting v2 chunk {}", spec.compressed_md5);
                match download_tx.send(DownloadMessage::Task(task)) {
                    Ok(()) => shared.chunk_submitted(),
                    Err(SendError(msg)) => {
                        warn!("failed to push v2 task to download");
                        reclaim_slot(&scratch, msg);
                        v2.push_front(spec);
                        break;
                    }
                }
            }
        }
        if no_scratch {
            let _ = scratch_ready_rx.recv_timeout(ExecutorConsts::COND_WAIT);
        } else {
            let _ = task_ready_rx.recv_timeout(ExecutorConsts::COND_WAIT);
        }
    }
    debug!("download scheduler exiting");
}

fn reclaim_slot(scratch: &ScratchPool, msg: DownloadMessage) {
    if let DownloadMessage::Task(task) = msg {
        scratch.release(task.scratch().to_path_buf());
    }
}

/// Uniform view of the two chunk-task shapes for writer dispatch.
struct ChunkView {
    id: String,
    size: u64,
    md5: Option<String>,
    cleanup: bool,
    offload: bool,
    old_offset: Option<u64>,
    old_flags: TaskFlag,
    old_file: Option<String>,
}

impl ChunkView {
    fn from_chunk(task: &ChunkTask) -> Self {
        Self {
            id: task.compressed_md5.clone(),
            size: task.size,
            md5: Some(task.md5.clone()),
            cleanup: task.cleanup,
            offload: task.offload_to_cache,
            old_offset: task.old_offset,
            old_flags: task.old_flags,
            old_file: task.old_file.clone(),
        }
    }

    fn from_v1(task: &V1Task) -> Self {
        Self {
            id: task.chunk_id(),
            size: task.size,
            md5: None,
            cleanup: true,
            offload: false,
            old_offset: None,
            old_flags: TaskFlag::empty(),
            old_file: None,
        }
    }
}

/// Task-advance loop: drives the plan forward in order, forwarding file
/// tasks immediately and blocking each chunk task until its download result
/// is in (or dispatching straight away when the bytes already live on disk).
#[allow(clippy::too_many_arguments)]
fn task_advance_loop(
    mut tasks: VecDeque<Task>,
    download_res_rx: Receiver<DownloadTaskResult>,
    download_tx: Sender<DownloadMessage>,
    writer_tx: Sender<WriterMessage>,
    task_ready_tx: Sender<()>,
    shared: Arc<ExecutorShared>,
    reporter: Arc<dyn ProgressReporter>,
    paths: InstallPaths,
) {
    debug!("download results collector starting");
    let mut ready: HashMap<String, DownloadTaskResult> = HashMap::new();
    let mut current_file = String::new();
    let mut current_dest = paths.root.clone();

    let mut next = tasks.pop_front();
    while shared.running() {
        let Some(task) = next.take() else { break };
        match task {
            Task::File(ft) => {
                let dest =
                    if ft.flags.contains(TaskFlag::SUPPORT) { &paths.support } else { &paths.root };
                let old_dest = if ft.old_flags.contains(TaskFlag::SUPPORT) {
                    &paths.support
                } else {
                    &paths.root
                };
                let mut wt = WriterTask::new(dest.clone(), &ft.path, ft.flags);
                wt.old_destination = Some(old_dest.clone());
                wt.old_file = ft.old_file.clone();
                wt.patch_file = ft.patch_file.clone();
                wt.hash = ft.expected_md5.clone();
                if ft.flags.contains(TaskFlag::OPEN_FILE) {
                    current_file = ft.path.clone();
                    current_dest = dest.clone();
                }
                if writer_tx.send(WriterMessage::Task(wt)).is_err() {
                    error!("writer queue closed unexpectedly");
                    shared.set_fatal();
                    break;
                }
                next = tasks.pop_front();
            }
            Task::Chunk(ct) => {
                let view = ChunkView::from_chunk(&ct);
                if !route_chunk(
                    view,
                    &mut ready,
                    &download_res_rx,
                    &download_tx,
                    &writer_tx,
                    &task_ready_tx,
                    &shared,
                    &reporter,
                    &paths,
                    &current_dest,
                    &current_file,
                ) {
                    break;
                }
                next = tasks.pop_front();
            }
            Task::V1(vt) => {
                let view = ChunkView::from_v1(&vt);
                if !route_chunk(
                    view,
                    &mut ready,
                    &download_res_rx,
                    &download_tx,
                    &writer_tx,
                    &task_ready_tx,
                    &shared,
                    &reporter,
                    &paths,
                    &current_dest,
                    &current_file,
                ) {
                    break;
                }
                next = tasks.pop_front();
            }
        }
    }
    debug!("download results collector exiting");
}

/// Dispatch one chunk to the writer, waiting on download results until its
/// bytes are available. Returns false when the loop must stop.
#[allow(clippy::too_many_arguments)]
fn route_chunk(
    view: ChunkView,
    ready: &mut HashMap<String, DownloadTaskResult>,
    download_res_rx: &Receiver<DownloadTaskResult>,
    download_tx: &Sender<DownloadMessage>,
    writer_tx: &Sender<WriterMessage>,
    task_ready_tx: &Sender<()>,
    shared: &ExecutorShared,
    reporter: &Arc<dyn ProgressReporter>,
    paths: &InstallPaths,
    current_dest: &Path,
    current_file: &str,
) -> bool {
    loop {
        if !shared.running() {
            return false;
        }
        if view.old_file.is_some() || ready.contains_key(&view.id) {
            let mut flags = TaskFlag::empty();
            if view.cleanup {
                flags |= TaskFlag::RELEASE_TEMP;
            }
            if view.offload {
                flags |= TaskFlag::OFFLOAD_TO_CACHE;
            }
            if view.old_flags.contains(TaskFlag::ZIP_DEC) {
                flags |= TaskFlag::ZIP_DEC;
            }
            let mut wt = WriterTask::new(current_dest.to_path_buf(), current_file, flags);
            wt.size = Some(view.size);
            wt.hash = view.md5.clone();
            wt.old_offset = view.old_offset;
            wt.old_file = view.old_file.clone();
            if view.old_flags.contains(TaskFlag::SUPPORT) {
                wt.old_destination = Some(paths.support.clone());
            }
            if view.old_file.is_none() {
                wt.scratch = ready.get(&view.id).map(|res| res.task.scratch().to_path_buf());
            }
            debug!("adding chunk {} to writer", view.id);
            if writer_tx.send(WriterMessage::Task(wt)).is_err() {
                error!("writer queue closed unexpectedly");
                shared.set_fatal();
                return false;
            }
            if view.cleanup && view.old_file.is_none() {
                ready.remove(&view.id);
            }
            return true;
        }

        match download_res_rx.recv_timeout(ExecutorConsts::QUEUE_WAIT) {
            Ok(res) if res.success => {
                debug!("chunk {} ready", res.task.chunk_id());
                reporter.downloaded(res.downloaded, res.decompressed);
                shared.chunk_routed();
                ready.insert(res.task.chunk_id().to_string(), res);
                notify(task_ready_tx);
            }
            Ok(mut res) => {
                let reason = res.fail_reason.unwrap_or(FailReason::Unknown);
                if reason == FailReason::Unauthorized {
                    error!("CDN rejected the secure link, aborting");
                    shared.set_fatal();
                    return false;
                }
                if res.task.requeues >= DownloadConsts::MAX_CHUNK_REQUEUES {
                    error!(
                        "chunk {} failed {} times ({reason}), aborting",
                        res.task.chunk_id(),
                        res.task.requeues + 1
                    );
                    shared.set_fatal();
                    return false;
                }
                warn!("chunk {} download failed ({reason}), re-queueing", res.task.chunk_id());
                res.task.requeues += 1;
                if download_tx.send(DownloadMessage::Task(res.task)).is_err() {
                    warn!("failed to resubmit download task");
                }
                notify(task_ready_tx);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Writer-result loop: journals closed files, releases scratch slots, and
/// escalates writer failures to a run-fatal stop.
fn writer_result_loop(
    writer_res_rx: Receiver<WriterFeedback>,
    scratch: Arc<ScratchPool>,
    scratch_ready_tx: Sender<()>,
    shared: Arc<ExecutorShared>,
    reporter: Arc<dyn ProgressReporter>,
    hash_map: Arc<HashMap<String, String>>,
    resume_file: PathBuf,
) {
    debug!("writer results collector starting");
    while shared.running() {
        let feedback = match writer_res_rx.recv_timeout(ExecutorConsts::QUEUE_WAIT) {
            Ok(feedback) => feedback,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let res = match feedback {
            WriterFeedback::Terminated => break,
            WriterFeedback::Result(res) => res,
        };

        if res.success
            && res.task.flags.contains(TaskFlag::CLOSE_FILE)
            && !res.task.file_path.ends_with(".delta")
        {
            journal_closed_file(&hash_map, &resume_file, &res.task);
        }
        if !res.success {
            error!("task writer failed, aborting the run");
            shared.set_fatal();
            return;
        }

        reporter.written(res.written);
        if res.task.flags.contains(TaskFlag::RELEASE_TEMP)
            && let Some(slot) = res.task.scratch.clone()
        {
            debug!("releasing scratch slot {}", slot.display());
            scratch.release(slot);
        }
        notify(&scratch_ready_tx);
        shared.item_processed();
    }
    debug!("writer results collector exiting");
}

/// Append one journal line for a successfully closed file. `.tmp` is
/// stripped so the entry names the final path; files with no recorded
/// checksum are skipped with a warning.
fn journal_closed_file(
    hash_map: &HashMap<String, String>,
    resume_file: &Path,
    task: &WriterTask,
) {
    let path = task.file_path.strip_suffix(".tmp").unwrap_or(&task.file_path);
    let Some(checksum) = hash_map.get(&path.to_lowercase()) else {
        warn!("no checksum for closed file {path}, unable to journal it");
        return;
    };
    let support = if task.flags.contains(TaskFlag::SUPPORT) { "support" } else { "" };
    let line = format!("{checksum}:{support}:{path}\n");
    let written = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(resume_file)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = written {
        warn!("could not update resume journal: {e}");
    }
}
