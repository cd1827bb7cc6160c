//! Fixed pool of on-disk scratch slots for in-flight chunks.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

use crate::utils::config::PackagePaths;

/// `4 × workers` reusable buffer paths inside a process-private temp
/// directory. A slot is exclusively owned by a download task from acquire
/// until the writer signals `RELEASE_TEMP`. The directory (and any bytes
/// abandoned by overdue workers) disappears when the pool is dropped.
pub struct ScratchPool {
    dir: TempDir,
    slots: Mutex<VecDeque<PathBuf>>,
}

impl ScratchPool {
    pub fn new(slot_count: usize) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(PackagePaths::get().scratch_prefix())
            .tempdir()
            .context("create scratch directory")?;
        let slots = (0..slot_count)
            .map(|i| dir.path().join(format!("chunk_{i}.tmp")))
            .collect();
        Ok(Self {
            dir,
            slots: Mutex::new(slots),
        })
    }

    /// Non-blocking acquire. Exhaustion is the scheduler's throttle signal.
    pub fn try_acquire(&self) -> Option<PathBuf> {
        self.slots.lock().unwrap().pop_front()
    }

    /// Return a slot to the head of the pool.
    pub fn release(&self, slot: PathBuf) {
        self.slots.lock().unwrap().push_front(slot);
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Slots currently free.
    pub fn free_slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
