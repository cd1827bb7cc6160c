//! Task-stream vocabulary shared by the planner, the orchestrator loops, and
//! the workers.
//!
//! The planner emits [`Task`]s in execution order. The orchestrator splits
//! them into writer work orders ([`WriterTask`]) and chunk fetches
//! ([`DownloadTask`]); the workers answer with result messages.

use bitflags::bitflags;
use std::path::{Path, PathBuf};
use thiserror::Error;

bitflags! {
    /// Bit set the writer and the task-advance loop dispatch on.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TaskFlag: u16 {
        const SUPPORT = 1 << 0;
        const OPEN_FILE = 1 << 1;
        const CLOSE_FILE = 1 << 2;
        const CREATE_FILE = 1 << 3;
        const CREATE_SYMLINK = 1 << 4;
        const RENAME_FILE = 1 << 5;
        const COPY_FILE = 1 << 6;
        const DELETE_FILE = 1 << 7;
        const OFFLOAD_TO_CACHE = 1 << 8;
        const MAKE_EXE = 1 << 9;
        const PATCH = 1 << 10;
        const RELEASE_TEMP = 1 << 11;
        const ZIP_DEC = 1 << 12;
    }
}

/// File-boundary task: opens, closes, copies, renames, deletes, links,
/// chmods, or patches one logical path.
#[derive(Clone, Debug)]
pub struct FileTask {
    pub path: String,
    pub flags: TaskFlag,
    /// Flags of the old file referenced by `old_file` (routing only).
    pub old_flags: TaskFlag,
    pub old_file: Option<String>,
    pub patch_file: Option<String>,
    /// Whole-file md5 the writer must observe at `CLOSE_FILE`, when the
    /// manifest knows one.
    pub expected_md5: Option<String>,
}

impl FileTask {
    pub fn new(path: &str, flags: TaskFlag) -> Self {
        Self {
            path: path.to_string(),
            flags,
            old_flags: TaskFlag::empty(),
            old_file: None,
            patch_file: None,
            expected_md5: None,
        }
    }

    pub fn with_old_file(mut self, old_flags: TaskFlag, old_file: &str) -> Self {
        self.old_flags = old_flags;
        self.old_file = Some(old_file.to_string());
        self
    }

    pub fn with_expected_md5(mut self, md5: Option<String>) -> Self {
        self.expected_md5 = md5;
        self
    }
}

/// V2 content-addressed chunk task.
#[derive(Clone, Debug)]
pub struct ChunkTask {
    pub product_id: String,
    pub index: usize,
    pub compressed_md5: String,
    pub md5: String,
    pub size: u64,
    pub download_size: u64,
    /// Release the scratch slot after the writer consumed the bytes.
    pub cleanup: bool,
    /// Copy the decompressed bytes into the chunk cache as well.
    pub offload_to_cache: bool,
    /// When set, the bytes come from `old_file` at this offset instead of a
    /// download.
    pub old_offset: Option<u64>,
    pub old_flags: TaskFlag,
    pub old_file: Option<String>,
}

impl ChunkTask {
    pub fn new(product_id: &str, index: usize, chunk: &crate::types::DepotChunk) -> Self {
        Self {
            product_id: product_id.to_string(),
            index,
            compressed_md5: chunk.compressed_md5.clone(),
            md5: chunk.md5.clone(),
            size: chunk.size,
            download_size: chunk.compressed_size,
            cleanup: false,
            offload_to_cache: false,
            old_offset: None,
            old_flags: TaskFlag::empty(),
            old_file: None,
        }
    }
}

/// V1 ranged chunk task. Its identity is synthetic: `<file md5>_<index>`.
#[derive(Clone, Debug)]
pub struct V1Task {
    pub product_id: String,
    pub index: usize,
    /// Offset inside the product blob.
    pub offset: u64,
    pub size: u64,
    /// md5 of the whole file this range belongs to.
    pub file_md5: String,
}

impl V1Task {
    /// Unique chunk id used to match download results to writer dispatch.
    /// Not an actual checksum.
    pub fn chunk_id(&self) -> String {
        format!("{}_{}", self.file_md5, self.index)
    }
}

/// One element of the planner's ordered task stream.
#[derive(Clone, Debug)]
pub enum Task {
    File(FileTask),
    Chunk(ChunkTask),
    V1(V1Task),
}

/// Failure codes reported by the download worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FailReason {
    #[error("unknown failure")]
    Unknown,
    #[error("checksum mismatch")]
    Checksum,
    #[error("connection failed")]
    Connection,
    #[error("unauthorized")]
    Unauthorized,
    #[error("no secure link for chunk")]
    MissingChunk,
}

/// Ranged fetch of a V1 byte region into a scratch slot.
#[derive(Clone, Debug)]
pub struct V1Download {
    pub product_id: String,
    pub offset: u64,
    pub size: u64,
    pub chunk_id: String,
    pub scratch: PathBuf,
}

/// Fetch-and-decompress of a V2 chunk into a scratch slot.
#[derive(Clone, Debug)]
pub struct V2Download {
    pub product_id: String,
    pub compressed_md5: String,
    pub scratch: PathBuf,
}

/// Work order for a download worker. The scratch slot stays bound to the
/// task across retries and re-enqueues.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    pub kind: DownloadKind,
    /// Times the orchestrator re-enqueued this task after a terminal worker
    /// failure. Bounded; see `DownloadConsts::MAX_CHUNK_REQUEUES`.
    pub requeues: u32,
}

#[derive(Clone, Debug)]
pub enum DownloadKind {
    V1(V1Download),
    V2(V2Download),
}

impl DownloadTask {
    pub fn v1(dl: V1Download) -> Self {
        Self { kind: DownloadKind::V1(dl), requeues: 0 }
    }

    pub fn v2(dl: V2Download) -> Self {
        Self { kind: DownloadKind::V2(dl), requeues: 0 }
    }

    /// Uniform chunk identity: compressed md5 for V2, synthetic id for V1.
    pub fn chunk_id(&self) -> &str {
        match &self.kind {
            DownloadKind::V1(dl) => &dl.chunk_id,
            DownloadKind::V2(dl) => &dl.compressed_md5,
        }
    }

    pub fn scratch(&self) -> &Path {
        match &self.kind {
            DownloadKind::V1(dl) => &dl.scratch,
            DownloadKind::V2(dl) => &dl.scratch,
        }
    }
}

/// Message to a download worker.
#[derive(Clone, Debug)]
pub enum DownloadMessage {
    Task(DownloadTask),
    Terminate,
}

/// Outcome of one download task (after worker-level retries).
#[derive(Clone, Debug)]
pub struct DownloadTaskResult {
    pub success: bool,
    pub fail_reason: Option<FailReason>,
    pub task: DownloadTask,
    /// Compressed (on-wire) bytes received.
    pub downloaded: u64,
    /// Bytes written to the scratch slot.
    pub decompressed: u64,
}

impl DownloadTaskResult {
    pub fn ok(task: DownloadTask, downloaded: u64, decompressed: u64) -> Self {
        Self { success: true, fail_reason: None, task, downloaded, decompressed }
    }

    pub fn failed(task: DownloadTask, reason: FailReason) -> Self {
        Self { success: false, fail_reason: Some(reason), task, downloaded: 0, decompressed: 0 }
    }
}

/// Work order for the writer worker.
#[derive(Clone, Debug)]
pub struct WriterTask {
    /// Destination root the (relative) `file_path` resolves against.
    pub destination: PathBuf,
    pub file_path: String,
    pub flags: TaskFlag,
    /// Chunk md5 for cache offload, or the expected whole-file md5 on a
    /// `CLOSE_FILE` task.
    pub hash: Option<String>,
    pub size: Option<u64>,
    /// Scratch slot holding downloaded bytes to append.
    pub scratch: Option<PathBuf>,
    /// Root `old_file` resolves against when it differs from `destination`.
    pub old_destination: Option<PathBuf>,
    pub old_file: Option<String>,
    pub old_offset: Option<u64>,
    pub patch_file: Option<String>,
}

impl WriterTask {
    pub fn new(destination: PathBuf, file_path: &str, flags: TaskFlag) -> Self {
        Self {
            destination,
            file_path: file_path.to_string(),
            flags,
            hash: None,
            size: None,
            scratch: None,
            old_destination: None,
            old_file: None,
            old_offset: None,
            patch_file: None,
        }
    }
}

/// Message to the writer worker.
#[derive(Clone, Debug)]
pub enum WriterMessage {
    Task(WriterTask),
    Terminate,
}

/// Outcome of one writer task.
#[derive(Clone, Debug)]
pub struct WriterTaskResult {
    pub success: bool,
    pub task: WriterTask,
    pub written: u64,
}

/// Answer stream from the writer worker.
#[derive(Clone, Debug)]
pub enum WriterFeedback {
    Result(WriterTaskResult),
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_chunk_identity_is_hash_and_index() {
        let task = V1Task {
            product_id: "1207658930".into(),
            index: 3,
            offset: 1024,
            size: 512,
            file_md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
        };
        assert_eq!(task.chunk_id(), "d41d8cd98f00b204e9800998ecf8427e_3");
    }

    #[test]
    fn download_task_identity_matches_variant() {
        let v2 = DownloadTask::v2(V2Download {
            product_id: "p".into(),
            compressed_md5: "abc".into(),
            scratch: PathBuf::from("/tmp/chunk_0.tmp"),
        });
        assert_eq!(v2.chunk_id(), "abc");

        let v1 = DownloadTask::v1(V1Download {
            product_id: "p".into(),
            offset: 0,
            size: 10,
            chunk_id: "h_0".into(),
            scratch: PathBuf::from("/tmp/chunk_1.tmp"),
        });
        assert_eq!(v1.chunk_id(), "h_0");
    }
}
