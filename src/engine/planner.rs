//! Task planner: walks a manifest diff and emits the ordered task stream,
//! the seeded download queues, the resume hash map, and the disk-space
//! accounting the pre-flight check runs against.

use log::{info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;

use crate::engine::tasks::{ChunkTask, FileTask, Task, TaskFlag, V1Task};
use crate::pipeline::context::InstallPaths;
use crate::types::{DepotChunk, DepotFile, Diff, DiffEntry, EntryFlags, FileDiff, FilePatchDiff, LinuxFile, V1File};
use crate::utils::config::ChunkConsts;
use crate::utils::paths::{case_insensitive_path, readable_size};

/// Queue entry for a V1 ranged fetch.
#[derive(Clone, Debug)]
pub struct V1DownloadSpec {
    pub product_id: String,
    pub chunk_id: String,
    pub offset: u64,
    pub size: u64,
}

/// Queue entry for a V2 chunk fetch.
#[derive(Clone, Debug)]
pub struct V2DownloadSpec {
    pub product_id: String,
    pub compressed_md5: String,
}

/// Everything the executor needs to run one install: the ordered task
/// stream, the seeded download queues, bookkeeping, and accounting.
#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: VecDeque<Task>,
    pub v1_downloads: VecDeque<V1DownloadSpec>,
    pub v2_downloads: VecDeque<V2DownloadSpec>,
    /// `lowercase path -> recorded checksum`, consulted when writing the
    /// resume journal.
    pub hash_map: HashMap<String, String>,
    /// Compressed bytes that will cross the wire.
    pub download_size: u64,
    /// Bytes the installed tree will hold.
    pub disk_size: u64,
    /// Peak transient disk growth; the pre-flight check refuses when the
    /// target filesystem cannot absorb it.
    pub required_disk_size_delta: i64,
}

impl Plan {
    /// One writer result arrives per task; the run completes at this count.
    pub fn items_to_complete(&self) -> usize {
        self.tasks.len()
    }
}

/// Walk `diff` and build the [`Plan`]. Consults the resume journal and the
/// leftover chunk cache under `paths`; never touches the target tree.
pub fn build_plan(diff: &Diff, paths: &InstallPaths) -> Plan {
    let mut planner = Planner::new(paths);
    planner.plan_deletions(diff);
    planner.current_tmp = planner.plan.required_disk_size_delta;
    planner.seed_cache();
    planner.index_incoming(diff);
    planner.read_resume_journal();

    for entry in diff.incoming() {
        match entry {
            DiffEntry::V1(f) => planner.plan_v1(f),
            DiffEntry::Linux(f) => planner.plan_linux(f),
            DiffEntry::Depot(f) => planner.plan_depot(f),
            DiffEntry::Diff(d) => planner.plan_file_diff(d),
            DiffEntry::Patch(p) => planner.plan_patch_diff(p),
        }
        planner.bump_required();
    }
    for link in &diff.links {
        planner.plan.tasks.push_back(Task::File(
            FileTask::new(&link.path, TaskFlag::CREATE_SYMLINK)
                .with_old_file(TaskFlag::empty(), &link.target),
        ));
    }

    info!(
        "download size: {}, required disk delta: {}",
        readable_size(planner.plan.download_size),
        readable_size(planner.plan.required_disk_size_delta.max(0) as u64),
    );
    planner.plan
}

struct Planner<'a> {
    paths: &'a InstallPaths,
    plan: Plan,
    /// Remaining future uses per compressed md5; drives cache offloading.
    shared_chunks: HashMap<String, usize>,
    completed: HashSet<String>,
    missing: HashSet<String>,
    mismatched: HashSet<String>,
    /// V1 whole-file hash -> (path, flags) of an already-planned copy source.
    downloaded_v1: HashMap<String, (String, EntryFlags)>,
    downloaded_linux: HashMap<String, String>,
    /// Decompressed md5s present (or planned) in the chunk cache.
    cached: HashSet<String>,
    /// V1 split size, derived from the biggest V2 chunk in the diff.
    split_size: u64,
    current_tmp: i64,
}

impl<'a> Planner<'a> {
    fn new(paths: &'a InstallPaths) -> Self {
        Self {
            paths,
            plan: Plan::default(),
            shared_chunks: HashMap::new(),
            completed: HashSet::new(),
            missing: HashSet::new(),
            mismatched: HashSet::new(),
            downloaded_v1: HashMap::new(),
            downloaded_linux: HashMap::new(),
            cached: HashSet::new(),
            split_size: 0,
            current_tmp: 0,
        }
    }

    fn bump_required(&mut self) {
        self.plan.required_disk_size_delta =
            self.plan.required_disk_size_delta.max(self.current_tmp);
    }

    fn support_flag(flags: EntryFlags) -> TaskFlag {
        if flags.support { TaskFlag::SUPPORT } else { TaskFlag::empty() }
    }

    /// Deletion prelude: drop outgoing files before anything downloads.
    fn plan_deletions(&mut self, diff: &Diff) {
        for entry in diff.outgoing() {
            let flags = TaskFlag::DELETE_FILE
                | if entry.support() { TaskFlag::SUPPORT } else { TaskFlag::empty() };
            self.plan.tasks.push_back(Task::File(FileTask::new(entry.path(), flags)));
            self.plan.required_disk_size_delta -= entry.installed_size() as i64;
        }
    }

    /// Reuse cache entries left over by an interrupted run.
    fn seed_cache(&mut self) {
        let Ok(entries) = fs::read_dir(&self.paths.cache) else { return };
        for entry in entries.flatten() {
            self.cached.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    /// First pass: record every file's resume checksum, count shared-chunk
    /// uses, and find the biggest chunk (sets the V1 split size).
    fn index_incoming(&mut self, diff: &Diff) {
        let mut biggest = 0u64;
        for entry in diff.incoming() {
            match entry {
                DiffEntry::V1(f) => {
                    self.plan.hash_map.insert(f.path.to_lowercase(), f.hash.clone());
                }
                DiffEntry::Linux(f) => {
                    self.plan.hash_map.insert(f.path.to_lowercase(), f.hash.clone());
                }
                DiffEntry::Depot(f) => {
                    self.record_checksum(f);
                    for chunk in &f.chunks {
                        *self.shared_chunks.entry(chunk.compressed_md5.clone()).or_default() += 1;
                        biggest = biggest.max(chunk.size);
                    }
                }
                DiffEntry::Diff(d) => {
                    self.record_checksum(&d.file);
                    for chunk in &d.file.chunks {
                        if chunk.old_offset.is_none() {
                            *self
                                .shared_chunks
                                .entry(chunk.compressed_md5.clone())
                                .or_default() += 1;
                            biggest = biggest.max(chunk.size);
                        }
                    }
                }
                DiffEntry::Patch(p) => {
                    self.record_checksum(&p.new_file);
                    for chunk in &p.chunks {
                        *self.shared_chunks.entry(chunk.compressed_md5.clone()).or_default() += 1;
                        biggest = biggest.max(chunk.size);
                    }
                }
            }
        }
        // V1 ranges reuse the V2 chunk sizing so scratch slots fit either.
        self.split_size = if biggest == 0 {
            ChunkConsts::DEFAULT_SPLIT
        } else {
            biggest.max(ChunkConsts::MIN_SPLIT)
        };
    }

    fn record_checksum(&mut self, f: &DepotFile) {
        if let Some(sum) = f.record_checksum() {
            self.plan.hash_map.insert(f.path.to_lowercase(), sum.to_string());
        }
    }

    /// Partition journaled paths into completed / mismatched / missing. A
    /// malformed journal is dropped entirely and the run starts over.
    fn read_resume_journal(&mut self) {
        let Ok(text) = fs::read_to_string(&self.paths.resume_file) else { return };
        info!("resume journal found, attempting to continue");
        let (mut missing, mut mismatched) = (0usize, 0usize);
        for line in text.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(hash), Some(support), Some(file_path)) =
                (parts.next(), parts.next(), parts.next())
            else {
                warn!("unreadable resume entry {line:?}, starting over");
                self.completed.clear();
                self.missing.clear();
                self.mismatched.clear();
                return;
            };

            let root = if support == "support" { &self.paths.support } else { &self.paths.root };
            let key = file_path.to_lowercase();
            if !case_insensitive_path(&root.join(file_path)).exists() {
                self.missing.insert(key);
                missing += 1;
                continue;
            }
            match self.plan.hash_map.get(&key) {
                Some(expected) if expected == hash => {
                    self.completed.insert(key);
                }
                _ => {
                    self.mismatched.insert(key);
                    mismatched += 1;
                }
            }
        }
        if missing > 0 {
            warn!("{missing} journaled files are missing and will be re-downloaded");
        }
        if mismatched > 0 {
            warn!("{mismatched} files changed since the last run and will be re-downloaded");
        }
    }

    fn plan_v1(&mut self, f: &V1File) {
        let support = Self::support_flag(f.flags);
        if f.size == 0 {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::CREATE_FILE | support)));
            return;
        }
        if self.completed.contains(&f.path.to_lowercase()) {
            // Later duplicates of this hash can still copy from it.
            self.downloaded_v1.insert(f.hash.clone(), (f.path.clone(), f.flags));
            return;
        }
        self.plan.required_disk_size_delta += f.size as i64;

        if let Some((source, source_flags)) = self.downloaded_v1.get(&f.hash) {
            let task = FileTask::new(&f.path, TaskFlag::COPY_FILE | support)
                .with_old_file(Self::support_flag(*source_flags), source);
            self.plan.tasks.push_back(Task::File(task));
            if f.flags.executable {
                self.plan
                    .tasks
                    .push_back(Task::File(FileTask::new(&f.path, TaskFlag::MAKE_EXE | support)));
            }
            return;
        }

        self.plan
            .tasks
            .push_back(Task::File(FileTask::new(&f.path, TaskFlag::OPEN_FILE | support)));
        self.plan.download_size += f.size;
        self.plan.disk_size += f.size;
        self.split_into_ranges(&f.product_id, f.offset, f.size, &f.hash);
        self.plan.tasks.push_back(Task::File(
            FileTask::new(&f.path, TaskFlag::CLOSE_FILE | support)
                .with_expected_md5(Some(f.hash.clone())),
        ));
        if f.flags.executable {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::MAKE_EXE | support)));
        }
        self.downloaded_v1.insert(f.hash.clone(), (f.path.clone(), f.flags));
    }

    /// Split a V1 byte region into ranged chunk tasks and seed the V1 queue.
    fn split_into_ranges(&mut self, product_id: &str, base_offset: u64, size: u64, file_md5: &str) {
        let mut size_left = size;
        let mut chunk_offset = 0u64;
        let mut index = 0usize;
        while size_left > 0 {
            let chunk_size = size_left.min(self.split_size);
            let offset = base_offset + chunk_offset;
            let task = V1Task {
                product_id: product_id.to_string(),
                index,
                offset,
                size: chunk_size,
                file_md5: file_md5.to_string(),
            };
            self.plan.v1_downloads.push_back(V1DownloadSpec {
                product_id: product_id.to_string(),
                chunk_id: task.chunk_id(),
                offset,
                size: chunk_size,
            });
            self.plan.tasks.push_back(Task::V1(task));
            chunk_offset += chunk_size;
            size_left -= chunk_size;
            index += 1;
        }
    }

    fn plan_linux(&mut self, f: &LinuxFile) {
        if f.size == 0 {
            self.plan.tasks.push_back(Task::File(FileTask::new(&f.path, TaskFlag::CREATE_FILE)));
            return;
        }
        if self.completed.contains(&f.path.to_lowercase()) {
            self.downloaded_linux.insert(f.hash.clone(), f.path.clone());
            return;
        }
        self.plan.required_disk_size_delta += f.size as i64;

        if let Some(source) = self.downloaded_linux.get(&f.hash) {
            let task = FileTask::new(&f.path, TaskFlag::COPY_FILE)
                .with_old_file(TaskFlag::empty(), source);
            self.plan.tasks.push_back(Task::File(task));
            if f.flags.executable {
                self.plan.tasks.push_back(Task::File(FileTask::new(&f.path, TaskFlag::MAKE_EXE)));
            }
            return;
        }

        let tmp_path = format!("{}.tmp", f.path);
        self.plan
            .tasks
            .push_back(Task::File(FileTask::new(&tmp_path, TaskFlag::OPEN_FILE)));
        self.plan.download_size += f.compressed_size;
        self.plan.disk_size += f.size;
        self.split_into_ranges(&f.product_id, f.offset, f.compressed_size, &f.hash);
        // A plain (uncompressed) tmp holds the final bytes, so the close can
        // verify the whole-file hash; a deflate stream cannot.
        let tmp_md5 = (!f.compressed).then(|| f.hash.clone());
        self.plan.tasks.push_back(Task::File(
            FileTask::new(&tmp_path, TaskFlag::CLOSE_FILE).with_expected_md5(tmp_md5),
        ));

        if f.compressed {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::OPEN_FILE)));
            let dec_id = format!("{}_dec", f.hash);
            self.plan.tasks.push_back(Task::Chunk(ChunkTask {
                product_id: f.product_id.clone(),
                index: 0,
                compressed_md5: dec_id.clone(),
                md5: dec_id,
                size: f.compressed_size,
                download_size: f.compressed_size,
                cleanup: true,
                offload_to_cache: false,
                old_offset: Some(0),
                old_flags: TaskFlag::ZIP_DEC,
                old_file: Some(tmp_path.clone()),
            }));
            self.plan.tasks.push_back(Task::File(
                FileTask::new(&f.path, TaskFlag::CLOSE_FILE)
                    .with_expected_md5(Some(f.hash.clone())),
            ));
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&tmp_path, TaskFlag::DELETE_FILE)));
        } else {
            self.plan.tasks.push_back(Task::File(
                FileTask::new(&f.path, TaskFlag::RENAME_FILE | TaskFlag::DELETE_FILE)
                    .with_old_file(TaskFlag::empty(), &tmp_path),
            ));
        }
        if f.flags.executable {
            self.plan.tasks.push_back(Task::File(FileTask::new(&f.path, TaskFlag::MAKE_EXE)));
        }
        self.downloaded_linux.insert(f.hash.clone(), f.path.clone());
    }

    /// Decide where one downloadable V2 chunk's bytes come from: the wire
    /// (offloading to the cache when more uses follow) or an earlier cache
    /// entry. Returns the cache DELETE task when this use was the last.
    fn route_shared_chunk(
        &mut self,
        product_id: &str,
        chunk: &DepotChunk,
        task: &mut ChunkTask,
    ) -> Option<FileTask> {
        let is_cached = self.cached.contains(&chunk.md5);
        let uses_left = self.shared_chunks.get(&chunk.compressed_md5).copied().unwrap_or(0);

        if uses_left > 1 && !is_cached {
            self.plan.v2_downloads.push_back(V2DownloadSpec {
                product_id: product_id.to_string(),
                compressed_md5: chunk.compressed_md5.clone(),
            });
            self.plan.download_size += chunk.compressed_size;
            task.offload_to_cache = true;
            self.cached.insert(chunk.md5.clone());
            self.current_tmp += chunk.size as i64;
        } else if is_cached {
            task.old_offset = Some(0);
            // Absolute path; the writer's destination join keeps it absolute.
            task.old_file =
                Some(self.paths.cache.join(&chunk.md5).to_string_lossy().into_owned());
        } else {
            self.plan.v2_downloads.push_back(V2DownloadSpec {
                product_id: product_id.to_string(),
                compressed_md5: chunk.compressed_md5.clone(),
            });
            self.plan.download_size += chunk.compressed_size;
        }

        if let Some(count) = self.shared_chunks.get_mut(&chunk.compressed_md5) {
            *count = count.saturating_sub(1);
        }
        task.cleanup = true;

        let uses_left = self.shared_chunks.get(&chunk.compressed_md5).copied().unwrap_or(0);
        if is_cached && uses_left == 0 {
            self.cached.remove(&chunk.md5);
            self.current_tmp -= chunk.size as i64;
            return Some(FileTask::new(
                &self.paths.cache.join(&chunk.md5).to_string_lossy(),
                TaskFlag::DELETE_FILE,
            ));
        }
        None
    }

    fn plan_depot(&mut self, f: &DepotFile) {
        let support = Self::support_flag(f.flags);
        if f.chunks.is_empty() {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::CREATE_FILE | support)));
            return;
        }
        if self.completed.contains(&f.path.to_lowercase()) {
            return;
        }

        self.plan
            .tasks
            .push_back(Task::File(FileTask::new(&f.path, TaskFlag::OPEN_FILE | support)));
        for (index, chunk) in f.chunks.iter().enumerate() {
            let mut task = ChunkTask::new(&f.product_id, index, chunk);
            let cache_delete = self.route_shared_chunk(&f.product_id, chunk, &mut task);
            self.plan.disk_size += chunk.size;
            self.current_tmp += chunk.size as i64;
            self.plan.tasks.push_back(Task::Chunk(task));
            if let Some(delete) = cache_delete {
                self.plan.tasks.push_back(Task::File(delete));
            }
        }
        self.plan.tasks.push_back(Task::File(
            FileTask::new(&f.path, TaskFlag::CLOSE_FILE | support)
                .with_expected_md5(f.md5.clone()),
        ));
        if f.flags.executable {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::MAKE_EXE | support)));
        }
    }

    fn plan_file_diff(&mut self, d: &FileDiff) {
        let f = &d.file;
        let key = f.path.to_lowercase();
        if self.completed.contains(&key) {
            return;
        }
        let support = Self::support_flag(f.flags);
        let old_support = Self::support_flag(d.old_flags);

        let mut chunk_tasks: Vec<Task> = Vec::with_capacity(f.chunks.len());
        let mut reused = 0usize;
        let mut file_size = 0u64;
        let target_intact = !self.mismatched.contains(&key) && !self.missing.contains(&key);

        for (index, chunk) in f.chunks.iter().enumerate() {
            let mut task = ChunkTask::new(&f.product_id, index, chunk);
            file_size += chunk.size;
            if chunk.old_offset.is_some() && target_intact {
                task.old_offset = chunk.old_offset;
                task.old_flags = old_support;
                task.old_file = Some(f.path.clone());
                reused += 1;
                chunk_tasks.push(Task::Chunk(task));
            } else {
                let cache_delete = self.route_shared_chunk(&f.product_id, chunk, &mut task);
                chunk_tasks.push(Task::Chunk(task));
                if let Some(delete) = cache_delete {
                    chunk_tasks.push(Task::File(delete));
                }
            }
        }
        self.current_tmp += file_size as i64;
        self.bump_required();

        if reused > 0 {
            // Reused regions read the old content, so build into a tmp file
            // and swap it over the original afterwards.
            let tmp_path = format!("{}.tmp", f.path);
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&tmp_path, TaskFlag::OPEN_FILE | support)));
            self.plan.tasks.extend(chunk_tasks);
            self.plan.tasks.push_back(Task::File(
                FileTask::new(&tmp_path, TaskFlag::CLOSE_FILE | support)
                    .with_expected_md5(f.md5.clone()),
            ));
            self.plan.tasks.push_back(Task::File(
                FileTask::new(&f.path, TaskFlag::RENAME_FILE | TaskFlag::DELETE_FILE | support)
                    .with_old_file(TaskFlag::empty(), &tmp_path),
            ));
            self.current_tmp -= file_size as i64;
        } else {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::OPEN_FILE | support)));
            self.plan.tasks.extend(chunk_tasks);
            self.plan.tasks.push_back(Task::File(
                FileTask::new(&f.path, TaskFlag::CLOSE_FILE | support)
                    .with_expected_md5(f.md5.clone()),
            ));
        }
        if f.flags.executable {
            self.plan
                .tasks
                .push_back(Task::File(FileTask::new(&f.path, TaskFlag::MAKE_EXE | support)));
        }
        self.plan.disk_size += file_size;
    }

    fn plan_patch_diff(&mut self, p: &FilePatchDiff) {
        if self.completed.contains(&p.target.to_lowercase()) {
            return;
        }
        let product = format!("{}_patch", p.new_file.product_id);
        let out_file_size: u64 = p.new_file.chunks.iter().map(|c| c.size).sum();
        let old_file_size: u64 = p.old_file.chunks.iter().map(|c| c.size).sum();
        let delta_path = format!("{}.delta", p.target);
        let tmp_path = format!("{}.tmp", p.target);

        let mut chunk_tasks: Vec<Task> = Vec::with_capacity(p.chunks.len());
        let mut patch_size = 0u64;
        for (index, chunk) in p.chunks.iter().enumerate() {
            let mut task = ChunkTask::new(&product, index, chunk);
            patch_size += chunk.size;
            let cache_delete = self.route_shared_chunk(&product, chunk, &mut task);
            self.bump_required();
            chunk_tasks.push(Task::Chunk(task));
            if let Some(delete) = cache_delete {
                chunk_tasks.push(Task::File(delete));
            }
        }
        self.plan.disk_size += patch_size;
        self.current_tmp += patch_size as i64;
        self.bump_required();

        // Download the delta payload.
        self.plan
            .tasks
            .push_back(Task::File(FileTask::new(&delta_path, TaskFlag::OPEN_FILE)));
        self.plan.tasks.extend(chunk_tasks);
        self.plan
            .tasks
            .push_back(Task::File(FileTask::new(&delta_path, TaskFlag::CLOSE_FILE)));

        self.current_tmp += out_file_size as i64;
        self.bump_required();

        // Apply it onto a tmp file, drop the delta, swap over the target.
        let mut patch = FileTask::new(&tmp_path, TaskFlag::PATCH);
        patch.old_file = Some(p.source.clone());
        patch.patch_file = Some(delta_path.clone());
        self.plan.tasks.push_back(Task::File(patch));
        self.current_tmp -= patch_size as i64;
        self.bump_required();

        self.plan
            .tasks
            .push_back(Task::File(FileTask::new(&delta_path, TaskFlag::DELETE_FILE)));
        self.current_tmp -= old_file_size as i64;
        self.bump_required();

        self.plan.tasks.push_back(Task::File(
            FileTask::new(&p.target, TaskFlag::RENAME_FILE | TaskFlag::DELETE_FILE)
                .with_old_file(TaskFlag::empty(), &tmp_path),
        ));
        self.plan.disk_size += out_file_size;
    }
}
