//! Writer-worker tests over a real temp tree: flag dispatch, chunk appends,
//! cache offload, old-file reuse, hash verification, and failure results.

use crossbeam_channel::{Receiver, Sender, unbounded};
use gogdl::engine::tasks::{TaskFlag, WriterFeedback, WriterMessage, WriterTask, WriterTaskResult};
use gogdl::patch::Patcher;
use gogdl::workers::writer_worker;
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::Duration;

fn md5hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

struct WriterHarness {
    tx: Sender<WriterMessage>,
    rx: Receiver<WriterFeedback>,
    _speed_rx: Receiver<(u64, u64)>,
    handle: Option<JoinHandle<()>>,
}

impl WriterHarness {
    fn spawn(cache: PathBuf, patcher: Option<Arc<dyn Patcher>>) -> Self {
        let (tx, task_rx) = unbounded();
        let (res_tx, rx) = unbounded();
        let (speed_tx, speed_rx) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = std::thread::spawn(move || {
            writer_worker(task_rx, res_tx, speed_tx, cache, patcher, cancel)
        });
        Self { tx, rx, _speed_rx: speed_rx, handle: Some(handle) }
    }

    fn run(&self, task: WriterTask) -> WriterTaskResult {
        self.tx.send(WriterMessage::Task(task)).unwrap();
        match self.rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            WriterFeedback::Result(res) => res,
            WriterFeedback::Terminated => panic!("writer terminated early"),
        }
    }

    fn ok(&self, task: WriterTask) -> WriterTaskResult {
        let res = self.run(task);
        assert!(res.success, "writer task failed: {:?}", res.task);
        res
    }
}

impl Drop for WriterHarness {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterMessage::Terminate);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn task(dest: &Path, path: &str, flags: TaskFlag) -> WriterTask {
    WriterTask::new(dest.to_path_buf(), path, flags)
}

#[test]
fn open_append_close_materializes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let scratch = dir.path().join("chunk_0.tmp");
    fs::write(&scratch, b"hello chunk bytes").unwrap();

    writer.ok(task(&root, "data/out.bin", TaskFlag::OPEN_FILE));
    let mut append = task(&root, "data/out.bin", TaskFlag::RELEASE_TEMP);
    append.scratch = Some(scratch);
    append.size = Some(17);
    let res = writer.ok(append);
    assert_eq!(res.written, 17);

    let mut close = task(&root, "data/out.bin", TaskFlag::CLOSE_FILE);
    close.hash = Some(md5hex(b"hello chunk bytes"));
    writer.ok(close);

    assert_eq!(fs::read(root.join("data/out.bin")).unwrap(), b"hello chunk bytes");
}

#[test]
fn close_with_wrong_hash_fails() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let scratch = dir.path().join("chunk_0.tmp");
    fs::write(&scratch, b"data").unwrap();

    writer.ok(task(&root, "f", TaskFlag::OPEN_FILE));
    let mut append = task(&root, "f", TaskFlag::empty());
    append.scratch = Some(scratch);
    append.size = Some(4);
    writer.ok(append);

    let mut close = task(&root, "f", TaskFlag::CLOSE_FILE);
    close.hash = Some("00000000000000000000000000000000".to_string());
    let res = writer.run(close);
    assert!(!res.success);
}

#[test]
fn offload_copies_the_chunk_into_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let cache = dir.path().join("cache");
    let writer = WriterHarness::spawn(cache.clone(), None);

    let scratch = dir.path().join("chunk_0.tmp");
    fs::write(&scratch, b"shared bytes").unwrap();

    writer.ok(task(&root, "f", TaskFlag::OPEN_FILE));
    let mut append = task(&root, "f", TaskFlag::OFFLOAD_TO_CACHE | TaskFlag::RELEASE_TEMP);
    append.scratch = Some(scratch);
    append.size = Some(12);
    append.hash = Some("cacafeed".to_string());
    writer.ok(append);
    writer.ok(task(&root, "f", TaskFlag::CLOSE_FILE));

    assert_eq!(fs::read(cache.join("cacafeed")).unwrap(), b"shared bytes");
}

#[test]
fn old_file_region_is_reused_at_offset() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("previous"), b"0123456789").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    writer.ok(task(&root, "next", TaskFlag::OPEN_FILE));
    let mut reuse = task(&root, "next", TaskFlag::empty());
    reuse.old_file = Some("previous".to_string());
    reuse.old_offset = Some(4);
    reuse.size = Some(3);
    let res = writer.ok(reuse);
    assert_eq!(res.written, 3);
    writer.ok(task(&root, "next", TaskFlag::CLOSE_FILE));

    assert_eq!(fs::read(root.join("next")).unwrap(), b"456");
}

#[test]
fn copy_file_duplicates_and_tolerates_same_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("source"), b"payload").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let mut copy = task(&root, "Dup/Copy", TaskFlag::COPY_FILE);
    copy.old_file = Some("source".to_string());
    writer.ok(copy);
    assert_eq!(fs::read(root.join("Dup/Copy")).unwrap(), b"payload");

    // Copying a file onto itself is a no-op, not an error.
    let mut onto_self = task(&root, "source", TaskFlag::COPY_FILE);
    onto_self.old_file = Some("SOURCE".to_string());
    writer.ok(onto_self);
    assert_eq!(fs::read(root.join("source")).unwrap(), b"payload");
}

#[test]
fn rename_replaces_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("game.bin.tmp"), b"new version").unwrap();
    fs::write(root.join("game.bin"), b"old version").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let mut swap = task(&root, "game.bin", TaskFlag::RENAME_FILE | TaskFlag::DELETE_FILE);
    swap.old_file = Some("game.bin.tmp".to_string());
    writer.ok(swap);

    assert_eq!(fs::read(root.join("game.bin")).unwrap(), b"new version");
    assert!(!root.join("game.bin.tmp").exists());
}

#[test]
fn delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("doomed"), b"x").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    writer.ok(task(&root, "doomed", TaskFlag::DELETE_FILE));
    assert!(!root.join("doomed").exists());
    // Already gone: still a success (resumed runs replay deletions).
    writer.ok(task(&root, "doomed", TaskFlag::DELETE_FILE));
}

#[cfg(unix)]
#[test]
fn make_exe_sets_execute_bits() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("launcher"), b"#!/bin/sh\n").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    writer.ok(task(&root, "launcher", TaskFlag::MAKE_EXE));
    let mode = fs::metadata(root.join("launcher")).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
}

#[cfg(unix)]
#[test]
fn symlink_is_created_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let mut link = task(&root, "current", TaskFlag::CREATE_SYMLINK);
    link.old_file = Some("v1/bin".to_string());
    writer.ok(link);
    assert_eq!(fs::read_link(root.join("current")).unwrap(), PathBuf::from("v1/bin"));

    // Re-running the plan points the link at the new target.
    let mut relink = task(&root, "current", TaskFlag::CREATE_SYMLINK);
    relink.old_file = Some("v2/bin".to_string());
    writer.ok(relink);
    assert_eq!(fs::read_link(root.join("current")).unwrap(), PathBuf::from("v2/bin"));
}

#[test]
fn zip_dec_streams_the_tmp_through_the_decoder() {
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();

    let original = b"linux depot payload, stored deflated".repeat(100);
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&original).unwrap();
    let compressed = encoder.finish().unwrap();
    fs::write(root.join("game.bin.tmp"), &compressed).unwrap();

    let writer = WriterHarness::spawn(dir.path().join("cache"), None);
    writer.ok(task(&root, "game.bin", TaskFlag::OPEN_FILE));
    let mut dec = task(&root, "game.bin", TaskFlag::ZIP_DEC | TaskFlag::RELEASE_TEMP);
    dec.old_file = Some("game.bin.tmp".to_string());
    dec.old_offset = Some(0);
    dec.size = Some(compressed.len() as u64);
    let res = writer.ok(dec);
    assert_eq!(res.written, original.len() as u64);

    let mut close = task(&root, "game.bin", TaskFlag::CLOSE_FILE);
    close.hash = Some(md5hex(&original));
    writer.ok(close);

    assert_eq!(fs::read(root.join("game.bin")).unwrap(), original);
}

struct ConcatPatcher;

impl Patcher for ConcatPatcher {
    fn patch(&self, source: &Path, delta: &Path, output: &Path) -> anyhow::Result<()> {
        let mut bytes = fs::read(source)?;
        bytes.extend(fs::read(delta)?);
        fs::write(output, bytes)?;
        Ok(())
    }
}

#[test]
fn patch_invokes_the_configured_patcher() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("old"), b"base|").unwrap();
    fs::write(root.join("new.delta"), b"delta").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), Some(Arc::new(ConcatPatcher)));

    let mut apply = task(&root, "new.tmp", TaskFlag::PATCH);
    apply.old_file = Some("old".to_string());
    apply.patch_file = Some("new.delta".to_string());
    writer.ok(apply);

    assert_eq!(fs::read(root.join("new.tmp")).unwrap(), b"base|delta");
}

#[test]
fn patch_without_a_patcher_is_a_writer_failure() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("old"), b"base").unwrap();
    fs::write(root.join("new.delta"), b"delta").unwrap();
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let mut apply = task(&root, "new.tmp", TaskFlag::PATCH);
    apply.old_file = Some("old".to_string());
    apply.patch_file = Some("new.delta".to_string());
    let res = writer.run(apply);
    assert!(!res.success);
}

#[test]
fn chunk_bytes_without_an_open_file_fail() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let writer = WriterHarness::spawn(dir.path().join("cache"), None);

    let scratch = dir.path().join("chunk_0.tmp");
    fs::write(&scratch, b"orphan").unwrap();
    let mut append = task(&root, "nowhere", TaskFlag::empty());
    append.scratch = Some(scratch);
    append.size = Some(6);
    let res = writer.run(append);
    assert!(!res.success);
}
