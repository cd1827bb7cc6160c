//! Manifest-diff data model: the files, chunks, and links an install run
//! materializes, plus the secure-link table and per-run options.
//!
//! Manifest fetching and parsing live outside this crate; callers hand the
//! engine an already-digested [`Diff`] (e.g. deserialized from a job file).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Flags attached to a manifest entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EntryFlags {
    /// Gets the execute bits after writing (non-Windows).
    pub executable: bool,
    /// Belongs to the redistributable support tree, not the install root.
    pub support: bool,
}

/// V1 file: a byte region of a monolithic product blob (`main.bin`),
/// integrity-checked by the md5 of its full content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct V1File {
    pub product_id: String,
    pub path: String,
    pub size: u64,
    /// Offset of this file's bytes inside the product blob.
    pub offset: u64,
    /// md5 of the full file content.
    pub hash: String,
    #[serde(default)]
    pub flags: EntryFlags,
}

/// Linux loose-depot file: like V1, but the on-wire bytes may be
/// deflate-compressed and carry their own compressed size.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LinuxFile {
    pub product_id: String,
    pub path: String,
    pub size: u64,
    pub compressed_size: u64,
    pub offset: u64,
    pub hash: String,
    /// Set when the stored bytes are a deflate stream that must be
    /// decompressed after download.
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub flags: EntryFlags,
}

/// One content-addressed chunk of a V2 depot file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DepotChunk {
    /// md5 of the decompressed bytes.
    pub md5: String,
    /// md5 of the compressed (on-wire) bytes; the chunk's CDN identity.
    pub compressed_md5: String,
    pub size: u64,
    pub compressed_size: u64,
    /// Offset of identical bytes in the previous version of the same file,
    /// when the diff knows the region did not change.
    #[serde(default)]
    pub old_offset: Option<u64>,
}

/// V2 depot file: a sequence of individually content-addressed chunks.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DepotFile {
    pub product_id: String,
    pub path: String,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub chunks: Vec<DepotChunk>,
    #[serde(default)]
    pub flags: EntryFlags,
}

impl DepotFile {
    /// Checksum recorded for resume purposes: md5, then sha256, then the
    /// first chunk's md5.
    pub fn record_checksum(&self) -> Option<&str> {
        self.md5
            .as_deref()
            .or(self.sha256.as_deref())
            .or_else(|| self.chunks.first().map(|c| c.md5.as_str()))
    }
}

/// A changed V2 file whose chunks may reuse byte regions of the prior
/// version in place.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileDiff {
    pub file: DepotFile,
    /// Flags the file had in the previous manifest (routes old-content reads).
    #[serde(default)]
    pub old_flags: EntryFlags,
}

/// A changed V2 file shipped as a binary delta against its prior version.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilePatchDiff {
    /// Path of the existing file the delta applies to.
    pub source: String,
    /// Path the patched result lands at.
    pub target: String,
    pub old_file: DepotFile,
    pub new_file: DepotFile,
    /// Chunks of the delta payload itself.
    pub chunks: Vec<DepotChunk>,
}

/// Symbolic link to create (Unix only).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Symlink {
    pub path: String,
    pub target: String,
}

/// One entry of the new/changed/redist (or deleted) lists.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffEntry {
    V1(V1File),
    Linux(LinuxFile),
    Depot(DepotFile),
    Diff(FileDiff),
    Patch(FilePatchDiff),
}

impl DiffEntry {
    /// Install-relative path of the file this entry materializes.
    pub fn path(&self) -> &str {
        match self {
            DiffEntry::V1(f) => &f.path,
            DiffEntry::Linux(f) => &f.path,
            DiffEntry::Depot(f) => &f.path,
            DiffEntry::Diff(d) => &d.file.path,
            DiffEntry::Patch(p) => &p.target,
        }
    }

    /// True when the entry lives in the support tree.
    pub fn support(&self) -> bool {
        match self {
            DiffEntry::V1(f) => f.flags.support,
            DiffEntry::Linux(f) => f.flags.support,
            DiffEntry::Depot(f) => f.flags.support,
            DiffEntry::Diff(d) => d.file.flags.support,
            DiffEntry::Patch(p) => p.new_file.flags.support,
        }
    }

    /// Bytes freed when this entry is deleted (deletion-list accounting).
    pub fn installed_size(&self) -> u64 {
        match self {
            DiffEntry::V1(f) => f.size,
            DiffEntry::Linux(f) => f.size,
            DiffEntry::Depot(f) => f.chunks.iter().map(|c| c.size).sum(),
            DiffEntry::Diff(d) => d.file.chunks.iter().map(|c| c.size).sum(),
            DiffEntry::Patch(p) => p.new_file.chunks.iter().map(|c| c.size).sum(),
        }
    }
}

/// Manifest diff: what to delete, download, rewrite, patch, and link.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Diff {
    pub deleted: Vec<DiffEntry>,
    pub new: Vec<DiffEntry>,
    pub changed: Vec<DiffEntry>,
    pub redist: Vec<DiffEntry>,
    pub removed_redist: Vec<DiffEntry>,
    /// Unix only.
    pub links: Vec<Symlink>,
}

impl Diff {
    /// Entries that produce bytes on disk, in planner order.
    pub fn incoming(&self) -> impl Iterator<Item = &DiffEntry> {
        self.new.iter().chain(&self.changed).chain(&self.redist)
    }

    /// Entries whose files get removed before anything else runs.
    pub fn outgoing(&self) -> impl Iterator<Item = &DiffEntry> {
        self.deleted.iter().chain(&self.removed_redist)
    }
}

/// Signed CDN access for one product: either a literal URL (V1
/// redistributables) or a list of endpoint records, of which the first is
/// used.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SecureLink {
    Url(String),
    Endpoints(Vec<Endpoint>),
}

/// One secure-link endpoint record.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Endpoint {
    /// Template with `{param}` placeholders filled from `parameters`.
    pub url_format: String,
    /// Literal base URL (redist endpoints); the chunk path is appended
    /// directly and `url_format` is ignored.
    pub url: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// `product_id -> secure link` table supplied by the caller. Patch-diff
/// chunks are looked up under `<product_id>_patch`.
pub type SecureLinks = HashMap<String, SecureLink>;

/// Options for a single install/update run.
#[derive(Clone, Debug)]
pub struct InstallOpts {
    /// Download worker thread count.
    pub workers: usize,
    /// Support-tree destination. Default: `gog-support` inside the install
    /// root.
    pub support_path: Option<PathBuf>,
}

impl Default for InstallOpts {
    fn default() -> Self {
        Self {
            workers: crate::utils::config::ExecutorConsts::DEFAULT_WORKERS,
            support_path: None,
        }
    }
}
