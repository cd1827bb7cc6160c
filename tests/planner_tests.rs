//! Planner tests: task ordering, queue seeding, cache lifecycle, resume
//! partitioning, and disk-delta accounting on synthetic diffs.

use gogdl::engine::planner::{Plan, build_plan};
use gogdl::engine::tasks::{Task, TaskFlag};
use gogdl::pipeline::context::InstallPaths;
use gogdl::types::*;
use std::path::Path;

fn paths_for(root: &Path) -> InstallPaths {
    InstallPaths::new(root, None)
}

fn chunk(md5: &str, compressed_md5: &str, size: u64, compressed_size: u64) -> DepotChunk {
    DepotChunk {
        md5: md5.to_string(),
        compressed_md5: compressed_md5.to_string(),
        size,
        compressed_size,
        old_offset: None,
    }
}

fn depot_file(path: &str, md5: &str, chunks: Vec<DepotChunk>) -> DepotFile {
    DepotFile {
        product_id: "pid".to_string(),
        path: path.to_string(),
        md5: Some(md5.to_string()),
        sha256: None,
        chunks,
        flags: EntryFlags::default(),
    }
}

fn v1_file(path: &str, hash: &str, size: u64, offset: u64) -> V1File {
    V1File {
        product_id: "pid".to_string(),
        path: path.to_string(),
        size,
        offset,
        hash: hash.to_string(),
        flags: EntryFlags::default(),
    }
}

fn file_task(task: &Task) -> &gogdl::engine::tasks::FileTask {
    match task {
        Task::File(ft) => ft,
        other => panic!("expected file task, got {other:?}"),
    }
}

fn chunk_task(task: &Task) -> &gogdl::engine::tasks::ChunkTask {
    match task {
        Task::Chunk(ct) => ct,
        other => panic!("expected chunk task, got {other:?}"),
    }
}

#[test]
fn single_depot_file_plans_open_chunks_close() {
    let dir = tempfile::tempdir().unwrap();
    let f = depot_file(
        "bin/a",
        "00112233445566778899aabbccddeeff",
        vec![chunk("aa01", "ca01", 10, 7), chunk("bb02", "cb02", 5, 4)],
    );
    let diff = Diff { new: vec![DiffEntry::Depot(f)], ..Default::default() };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    assert_eq!(plan.tasks.len(), 4);
    let open = file_task(&plan.tasks[0]);
    assert!(open.flags.contains(TaskFlag::OPEN_FILE));
    assert_eq!(open.path, "bin/a");

    let first = chunk_task(&plan.tasks[1]);
    assert_eq!(first.compressed_md5, "ca01");
    assert!(first.cleanup);
    assert!(!first.offload_to_cache);
    let second = chunk_task(&plan.tasks[2]);
    assert_eq!(second.compressed_md5, "cb02");

    let close = file_task(&plan.tasks[3]);
    assert!(close.flags.contains(TaskFlag::CLOSE_FILE));
    assert_eq!(close.expected_md5.as_deref(), Some("00112233445566778899aabbccddeeff"));

    let queued: Vec<_> = plan.v2_downloads.iter().map(|d| d.compressed_md5.as_str()).collect();
    assert_eq!(queued, ["ca01", "cb02"]);
    assert!(plan.v1_downloads.is_empty());
    assert_eq!(plan.download_size, 11);
    assert_eq!(plan.disk_size, 15);
    assert_eq!(
        plan.hash_map.get("bin/a").map(String::as_str),
        Some("00112233445566778899aabbccddeeff")
    );
}

#[test]
fn duplicate_v1_hash_becomes_copy() {
    let dir = tempfile::tempdir().unwrap();
    let diff = Diff {
        new: vec![
            DiffEntry::V1(v1_file("x", "aaaa", 100, 0)),
            DiffEntry::V1(v1_file("y", "aaaa", 100, 0)),
        ],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    // OPEN x, one range (split size far above 100 bytes), CLOSE x, COPY y.
    assert_eq!(plan.tasks.len(), 4);
    assert!(matches!(&plan.tasks[1], Task::V1(t) if t.size == 100));
    let copy = file_task(&plan.tasks[3]);
    assert!(copy.flags.contains(TaskFlag::COPY_FILE));
    assert_eq!(copy.path, "y");
    assert_eq!(copy.old_file.as_deref(), Some("x"));

    assert_eq!(plan.v1_downloads.len(), 1);
    assert_eq!(plan.v1_downloads[0].chunk_id, "aaaa_0");
}

#[test]
fn large_v1_file_is_split_at_the_observed_chunk_floor() {
    let dir = tempfile::tempdir().unwrap();
    let size = 25 * 1024 * 1024;
    let diff = Diff {
        new: vec![DiffEntry::V1(v1_file("big", "cccc", size, 512))],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    // No V2 chunks observed: 20 MiB default split, so two ranges.
    assert_eq!(plan.v1_downloads.len(), 2);
    assert_eq!(plan.v1_downloads[0].offset, 512);
    assert_eq!(plan.v1_downloads[0].size, 20 * 1024 * 1024);
    assert_eq!(plan.v1_downloads[1].offset, 512 + 20 * 1024 * 1024);
    assert_eq!(plan.v1_downloads[1].size, 5 * 1024 * 1024);
}

#[test]
fn shared_chunk_offloads_then_reads_cache_then_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let shared_md5 = "feedbeef00000000000000000000cafe";
    let diff = Diff {
        new: vec![
            DiffEntry::Depot(depot_file("f1", "11", vec![chunk(shared_md5, "cfeed", 8, 6)])),
            DiffEntry::Depot(depot_file("f2", "22", vec![chunk(shared_md5, "cfeed", 8, 6)])),
        ],
        ..Default::default()
    };
    let paths = paths_for(dir.path());
    let plan = build_plan(&diff, &paths);

    // Only one wire fetch for the shared chunk.
    assert_eq!(plan.v2_downloads.len(), 1);

    let first_use = chunk_task(&plan.tasks[1]);
    assert!(first_use.offload_to_cache);
    assert!(first_use.old_file.is_none());

    let second_use = chunk_task(&plan.tasks[4]);
    assert!(!second_use.offload_to_cache);
    assert_eq!(second_use.old_offset, Some(0));
    let cache_entry = paths.cache.join(shared_md5);
    assert_eq!(second_use.old_file.as_deref(), Some(cache_entry.to_str().unwrap()));

    // The cache entry is deleted right after its last use.
    let delete = file_task(&plan.tasks[5]);
    assert!(delete.flags.contains(TaskFlag::DELETE_FILE));
    assert_eq!(delete.path, cache_entry.to_str().unwrap());

    // Invariant: offloads == distinct shared compressed md5s.
    let offloads = plan
        .tasks
        .iter()
        .filter(|t| matches!(t, Task::Chunk(c) if c.offload_to_cache))
        .count();
    assert_eq!(offloads, 1);
}

#[test]
fn patch_diff_emits_delta_patch_rename_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let patch = FilePatchDiff {
        source: "old".to_string(),
        target: "new".to_string(),
        old_file: depot_file("old", "0a", vec![chunk("o1", "co1", 100, 60)]),
        new_file: depot_file("new", "0b", vec![chunk("n1", "cn1", 120, 70)]),
        chunks: vec![chunk("p1", "cp1", 40, 30)],
    };
    let diff = Diff { changed: vec![DiffEntry::Patch(patch)], ..Default::default() };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    assert_eq!(plan.tasks.len(), 6);
    let open = file_task(&plan.tasks[0]);
    assert!(open.flags.contains(TaskFlag::OPEN_FILE));
    assert_eq!(open.path, "new.delta");
    assert_eq!(chunk_task(&plan.tasks[1]).compressed_md5, "cp1");
    let close = file_task(&plan.tasks[2]);
    assert!(close.flags.contains(TaskFlag::CLOSE_FILE));
    assert_eq!(close.path, "new.delta");

    let apply = file_task(&plan.tasks[3]);
    assert!(apply.flags.contains(TaskFlag::PATCH));
    assert_eq!(apply.path, "new.tmp");
    assert_eq!(apply.old_file.as_deref(), Some("old"));
    assert_eq!(apply.patch_file.as_deref(), Some("new.delta"));

    let drop_delta = file_task(&plan.tasks[4]);
    assert!(drop_delta.flags.contains(TaskFlag::DELETE_FILE));
    assert_eq!(drop_delta.path, "new.delta");

    let swap = file_task(&plan.tasks[5]);
    assert!(swap.flags.contains(TaskFlag::RENAME_FILE | TaskFlag::DELETE_FILE));
    assert_eq!(swap.path, "new");
    assert_eq!(swap.old_file.as_deref(), Some("new.tmp"));

    // Patch chunks download under the `_patch` product id.
    assert_eq!(plan.v2_downloads[0].product_id, "pid_patch");
}

#[test]
fn linux_compressed_file_bounces_through_tmp_and_decompresses() {
    let dir = tempfile::tempdir().unwrap();
    let f = LinuxFile {
        product_id: "pid".to_string(),
        path: "game/bin".to_string(),
        size: 300,
        compressed_size: 200,
        offset: 40,
        hash: "dddd".to_string(),
        compressed: true,
        flags: EntryFlags { executable: true, support: false },
    };
    let diff = Diff { new: vec![DiffEntry::Linux(f)], ..Default::default() };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    let flags: Vec<TaskFlag> = plan
        .tasks
        .iter()
        .map(|t| match t {
            Task::File(ft) => ft.flags,
            Task::V1(_) => TaskFlag::empty(),
            Task::Chunk(ct) => ct.old_flags,
        })
        .collect();
    assert_eq!(
        flags,
        vec![
            TaskFlag::OPEN_FILE,     // game/bin.tmp
            TaskFlag::empty(),       // ranged fetch of the deflate stream
            TaskFlag::CLOSE_FILE,    // game/bin.tmp
            TaskFlag::OPEN_FILE,     // game/bin
            TaskFlag::ZIP_DEC,       // stream tmp through the decoder
            TaskFlag::CLOSE_FILE,    // game/bin
            TaskFlag::DELETE_FILE,   // game/bin.tmp
            TaskFlag::MAKE_EXE,      // game/bin
        ]
    );
    let dec = chunk_task(&plan.tasks[4]);
    assert_eq!(dec.old_file.as_deref(), Some("game/bin.tmp"));
    assert_eq!(dec.size, 200);
    // The compressed tmp cannot be hash-checked; the final close can.
    assert!(file_task(&plan.tasks[2]).expected_md5.is_none());
    assert_eq!(file_task(&plan.tasks[5]).expected_md5.as_deref(), Some("dddd"));
}

#[test]
fn empty_files_become_a_single_create() {
    let dir = tempfile::tempdir().unwrap();
    let diff = Diff {
        new: vec![
            DiffEntry::V1(v1_file("empty1", "ee", 0, 0)),
            DiffEntry::Depot(depot_file("empty2", "ff", vec![])),
        ],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));
    assert_eq!(plan.tasks.len(), 2);
    for task in &plan.tasks {
        assert!(file_task(task).flags.contains(TaskFlag::CREATE_FILE));
    }
    assert!(plan.v1_downloads.is_empty() && plan.v2_downloads.is_empty());
}

#[test]
fn deletions_are_planned_first_and_reduce_the_disk_delta() {
    let dir = tempfile::tempdir().unwrap();
    let diff = Diff {
        deleted: vec![DiffEntry::V1(v1_file("gone", "11", 100, 0))],
        new: vec![DiffEntry::V1(v1_file("fresh", "22", 40, 0))],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    let first = file_task(&plan.tasks[0]);
    assert!(first.flags.contains(TaskFlag::DELETE_FILE));
    assert_eq!(first.path, "gone");
    assert_eq!(plan.required_disk_size_delta, -60);
}

#[test]
fn v2_growth_counts_toward_the_disk_delta() {
    let dir = tempfile::tempdir().unwrap();
    let diff = Diff {
        new: vec![DiffEntry::Depot(depot_file("a", "aa", vec![chunk("m1", "c1", 10, 5)]))],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));
    assert_eq!(plan.required_disk_size_delta, 10);
}

#[test]
fn every_open_has_exactly_one_close_with_chunks_between() {
    let dir = tempfile::tempdir().unwrap();
    let diff = Diff {
        new: vec![
            DiffEntry::Depot(depot_file("a", "aa", vec![chunk("m1", "c1", 10, 5)])),
            DiffEntry::V1(v1_file("b", "bb", 50, 0)),
            DiffEntry::Depot(depot_file("c", "cc", vec![chunk("m2", "c2", 4, 2), chunk("m3", "c3", 6, 3)])),
        ],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));

    let mut open: Option<&str> = None;
    for task in &plan.tasks {
        match task {
            Task::File(ft) if ft.flags.contains(TaskFlag::OPEN_FILE) => {
                assert!(open.is_none(), "nested OPEN_FILE for {}", ft.path);
                open = Some(&ft.path);
            }
            Task::File(ft) if ft.flags.contains(TaskFlag::CLOSE_FILE) => {
                assert_eq!(open.take(), Some(ft.path.as_str()), "unbalanced CLOSE_FILE");
            }
            Task::Chunk(_) | Task::V1(_) => {
                assert!(open.is_some(), "chunk outside an open file");
            }
            _ => {}
        }
    }
    assert!(open.is_none(), "dangling OPEN_FILE");
}

fn resume_fixture(root: &Path, journal_line: &str, create_file: bool) -> Plan {
    let paths = paths_for(root);
    if create_file {
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin/a"), b"anything").unwrap();
    }
    std::fs::write(&paths.resume_file, format!("{journal_line}\n")).unwrap();
    let diff = Diff {
        new: vec![
            DiffEntry::Depot(depot_file("bin/a", "aa11", vec![chunk("m1", "c1", 10, 5)])),
            DiffEntry::Depot(depot_file("bin/b", "bb22", vec![chunk("m2", "c2", 10, 5)])),
        ],
        ..Default::default()
    };
    build_plan(&diff, &paths)
}

#[test]
fn journaled_file_with_matching_hash_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let plan = resume_fixture(dir.path(), "aa11::bin/a", true);

    // Only bin/b is planned; no fetch for bin/a's chunk.
    assert!(plan.tasks.iter().all(|t| !matches!(t, Task::File(ft) if ft.path == "bin/a")));
    let queued: Vec<_> = plan.v2_downloads.iter().map(|d| d.compressed_md5.as_str()).collect();
    assert_eq!(queued, ["c2"]);
}

#[test]
fn journaled_file_with_stale_hash_is_replanned() {
    let dir = tempfile::tempdir().unwrap();
    let plan = resume_fixture(dir.path(), "0000::bin/a", true);
    assert_eq!(plan.v2_downloads.len(), 2);
    assert!(plan.tasks.iter().any(|t| matches!(t, Task::File(ft) if ft.path == "bin/a" && ft.flags.contains(TaskFlag::OPEN_FILE))));
}

#[test]
fn journaled_file_missing_on_disk_is_replanned() {
    let dir = tempfile::tempdir().unwrap();
    let plan = resume_fixture(dir.path(), "aa11::bin/a", false);
    assert_eq!(plan.v2_downloads.len(), 2);
}

#[test]
fn malformed_journal_is_ignored_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let plan = resume_fixture(dir.path(), "garbage-without-separators", true);
    assert_eq!(plan.v2_downloads.len(), 2);
}

#[test]
fn symlinks_are_planned_last() {
    let dir = tempfile::tempdir().unwrap();
    let diff = Diff {
        new: vec![DiffEntry::Depot(depot_file("a", "aa", vec![chunk("m1", "c1", 1, 1)]))],
        links: vec![Symlink { path: "latest".to_string(), target: "a".to_string() }],
        ..Default::default()
    };
    let plan = build_plan(&diff, &paths_for(dir.path()));
    let last = file_task(plan.tasks.back().unwrap());
    assert!(last.flags.contains(TaskFlag::CREATE_SYMLINK));
    assert_eq!(last.old_file.as_deref(), Some("a"));
}
