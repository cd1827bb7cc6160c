//! Writer worker: the only thread that mutates the target tree. Processes
//! tasks strictly in arrival order with at most one open output handle, and
//! keeps a running md5 of every byte appended between open and close so the
//! whole-file hash can be checked before a file is journaled.

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use flate2::read::DeflateDecoder;
use log::{debug, error, warn};
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::tasks::{TaskFlag, WriterFeedback, WriterMessage, WriterTask, WriterTaskResult};
use crate::patch::Patcher;
use crate::utils::config::{ExecutorConsts, WriterConsts};
use crate::utils::paths::{case_insensitive_path, prepare_location};

/// Worker body. Any task error becomes a `success: false` result, which the
/// orchestrator treats as fatal.
pub fn writer_worker(
    rx: Receiver<WriterMessage>,
    res_tx: Sender<WriterFeedback>,
    speed_tx: Sender<(u64, u64)>,
    cache: PathBuf,
    patcher: Option<Arc<dyn Patcher>>,
    cancel: Arc<AtomicBool>,
) {
    let mut writer = Writer {
        cache,
        patcher,
        speed_tx,
        out: None,
        current_path: PathBuf::new(),
        digest: Md5::new(),
    };

    loop {
        if cancel.load(Ordering::Relaxed) {
            debug!("writer cancelled");
            return;
        }
        let msg = match rx.recv_timeout(ExecutorConsts::WRITER_QUEUE_WAIT) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let task = match msg {
            WriterMessage::Terminate => {
                let _ = res_tx.send(WriterFeedback::Terminated);
                break;
            }
            WriterMessage::Task(task) => task,
        };

        let result = match writer.handle(&task) {
            Ok(written) => WriterTaskResult { success: true, task, written },
            Err(e) => {
                error!("writer task on {} failed: {e:#}", task.file_path);
                WriterTaskResult { success: false, task, written: 0 }
            }
        };
        if res_tx.send(WriterFeedback::Result(result)).is_err() {
            return;
        }
    }
    debug!("writer exiting");
}

struct Writer {
    cache: PathBuf,
    patcher: Option<Arc<dyn Patcher>>,
    speed_tx: Sender<(u64, u64)>,
    out: Option<File>,
    current_path: PathBuf,
    digest: Md5,
}

impl Writer {
    fn handle(&mut self, task: &WriterTask) -> Result<u64> {
        let task_path = case_insensitive_path(&task.destination.join(&task.file_path));
        if let Some(parent) = task_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            prepare_location(parent)
                .with_context(|| format!("prepare directory {}", parent.display()))?;
        }

        let flags = task.flags;
        if flags.contains(TaskFlag::CREATE_FILE) {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&task_path)
                .with_context(|| format!("create {}", task_path.display()))?;
            return Ok(0);
        }

        if flags.contains(TaskFlag::OPEN_FILE) {
            if self.out.is_some() {
                warn!("opening {} over an unclosed file", task_path.display());
            }
            self.out = Some(
                File::create(&task_path)
                    .with_context(|| format!("open {}", task_path.display()))?,
            );
            self.current_path = task_path;
            self.digest = Md5::new();
            return Ok(0);
        }

        if flags.contains(TaskFlag::CLOSE_FILE) {
            self.out = None;
            if let Some(expected) = &task.hash {
                let actual = hex::encode(self.digest.finalize_reset());
                if &actual != expected {
                    bail!(
                        "hash mismatch on {}: expected {expected}, wrote {actual}",
                        task_path.display()
                    );
                }
            }
            return Ok(0);
        }

        if flags.contains(TaskFlag::COPY_FILE) {
            if self.out.is_some() && task_path == self.current_path {
                warn!("copy over the unclosed file {}", task_path.display());
                self.out = None;
            }
            let old_file = task.old_file.as_ref().ok_or_else(|| anyhow!("copy without source"))?;
            let source_root = task.old_destination.as_ref().unwrap_or(&task.destination);
            let source = case_insensitive_path(&source_root.join(old_file));
            if let (Ok(a), Ok(b)) = (fs::canonicalize(&source), fs::canonicalize(&task_path))
                && a == b
            {
                return Ok(0);
            }
            fs::copy(&source, &task_path).with_context(|| {
                format!("copy {} -> {}", source.display(), task_path.display())
            })?;
            return Ok(0);
        }

        if flags.contains(TaskFlag::RENAME_FILE) {
            let old_file = task.old_file.as_ref().ok_or_else(|| anyhow!("rename without source"))?;
            let source_root = task.old_destination.as_ref().unwrap_or(&task.destination);
            let source = case_insensitive_path(&source_root.join(old_file));
            fs::rename(&source, &task_path).with_context(|| {
                format!("rename {} -> {}", source.display(), task_path.display())
            })?;
            return Ok(0);
        }

        if flags.contains(TaskFlag::DELETE_FILE) {
            if task_path.exists() {
                fs::remove_file(&task_path)
                    .with_context(|| format!("delete {}", task_path.display()))?;
            }
            return Ok(0);
        }

        if flags.contains(TaskFlag::CREATE_SYMLINK) {
            let target = task.old_file.as_ref().ok_or_else(|| anyhow!("symlink without target"))?;
            return self.create_symlink(target, &task_path);
        }

        if flags.contains(TaskFlag::PATCH) {
            let patcher = self.patcher.as_ref().ok_or_else(|| anyhow!("no delta patcher configured"))?;
            let old_file = task.old_file.as_ref().ok_or_else(|| anyhow!("patch without source"))?;
            let patch_file = task.patch_file.as_ref().ok_or_else(|| anyhow!("patch without delta"))?;
            let source_root = task.old_destination.as_ref().unwrap_or(&task.destination);
            let source = case_insensitive_path(&source_root.join(old_file));
            let delta = case_insensitive_path(&task.destination.join(patch_file));
            patcher.patch(&source, &delta, &task_path).with_context(|| {
                format!("apply {} to {}", delta.display(), source.display())
            })?;
            return Ok(0);
        }

        if flags.contains(TaskFlag::MAKE_EXE) {
            if self.out.is_some() && task_path == self.current_path {
                warn!("chmod on the unclosed file {}", task_path.display());
                self.out = None;
            }
            return self.make_executable(&task_path);
        }

        // Chunk-bearing tasks: append bytes into the open handle.
        if task.scratch.is_some() {
            self.append_from_scratch(task)
        } else if task.old_file.is_some() {
            self.append_from_old_file(task)
        } else {
            Ok(0)
        }
    }

    /// Append downloaded bytes from a scratch slot, optionally copying them
    /// into the chunk cache as well.
    fn append_from_scratch(&mut self, task: &WriterTask) -> Result<u64> {
        let scratch = task.scratch.as_ref().ok_or_else(|| anyhow!("no scratch slot"))?;
        let size = task.size.ok_or_else(|| anyhow!("chunk task without size"))?;
        let mut src =
            File::open(scratch).with_context(|| format!("open scratch {}", scratch.display()))?;
        let written = self.append_bytes(&mut src, size, false)?;

        if task.flags.contains(TaskFlag::OFFLOAD_TO_CACHE)
            && let Some(hash) = &task.hash
        {
            prepare_location(&self.cache).context("prepare chunk cache")?;
            fs::copy(scratch, self.cache.join(hash))
                .with_context(|| format!("offload chunk {hash} to cache"))?;
            let _ = self.speed_tx.send((size, 0));
        }
        Ok(written)
    }

    /// Append bytes that already exist on disk: a region of the previous
    /// file version, a cache entry, or (with `ZIP_DEC`) a deflate-compressed
    /// tmp that gets decompressed on the way through.
    fn append_from_old_file(&mut self, task: &WriterTask) -> Result<u64> {
        let old_file = task.old_file.as_ref().ok_or_else(|| anyhow!("no source file"))?;
        let size = task.size.ok_or_else(|| anyhow!("chunk task without size"))?;
        let source_root = task.old_destination.as_ref().unwrap_or(&task.destination);
        let source = case_insensitive_path(&source_root.join(old_file));
        let mut src =
            File::open(&source).with_context(|| format!("open {}", source.display()))?;
        if let Some(offset) = task.old_offset
            && offset > 0
        {
            src.seek(SeekFrom::Start(offset)).context("seek old file")?;
        }

        if task.flags.contains(TaskFlag::ZIP_DEC) {
            let mut decoder = DeflateDecoder::new(src.take(size));
            self.append_all(&mut decoder)
        } else {
            self.append_bytes(&mut src, size, true)
        }
    }

    /// Copy exactly `size` bytes from `src` into the open handle.
    fn append_bytes(&mut self, src: &mut impl Read, size: u64, count_read: bool) -> Result<u64> {
        let out = self.out.as_mut().ok_or_else(|| anyhow!("chunk bytes with no open file"))?;
        let mut buf = vec![0u8; WriterConsts::COPY_CHUNK_SIZE];
        let mut left = size;
        let mut written = 0u64;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            let n = src.read(&mut buf[..want]).context("read chunk bytes")?;
            if n == 0 {
                bail!("chunk source ended {left} bytes early");
            }
            out.write_all(&buf[..n]).context("append chunk bytes")?;
            self.digest.update(&buf[..n]);
            written += n as u64;
            left -= n as u64;
            let _ = self.speed_tx.send((n as u64, if count_read { n as u64 } else { 0 }));
        }
        Ok(written)
    }

    /// Copy `src` to the open handle until it runs dry (decompression, where
    /// the output size is not known up front).
    fn append_all(&mut self, src: &mut impl Read) -> Result<u64> {
        let out = self.out.as_mut().ok_or_else(|| anyhow!("chunk bytes with no open file"))?;
        let mut buf = vec![0u8; WriterConsts::COPY_CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let n = src.read(&mut buf).context("read chunk bytes")?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).context("append chunk bytes")?;
            self.digest.update(&buf[..n]);
            written += n as u64;
            let _ = self.speed_tx.send((n as u64, n as u64));
        }
        Ok(written)
    }

    #[cfg(unix)]
    fn create_symlink(&self, target: &str, link: &std::path::Path) -> Result<u64> {
        if link.symlink_metadata().is_ok() {
            fs::remove_file(link).with_context(|| format!("replace link {}", link.display()))?;
        }
        std::os::unix::fs::symlink(target, link)
            .with_context(|| format!("link {} -> {target}", link.display()))?;
        Ok(0)
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, _target: &str, _link: &std::path::Path) -> Result<u64> {
        bail!("symbolic links are not supported on this platform");
    }

    #[cfg(unix)]
    fn make_executable(&self, path: &std::path::Path) -> Result<u64> {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(path, perms)
            .with_context(|| format!("chmod {}", path.display()))?;
        Ok(0)
    }

    #[cfg(not(unix))]
    fn make_executable(&self, _path: &std::path::Path) -> Result<u64> {
        Ok(0)
    }
}
