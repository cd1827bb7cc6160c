//! Pre-flight disk space check.

use log::warn;
use std::path::Path;
use sysinfo::Disks;

/// Available bytes on the disk whose mount point is the longest prefix of
/// `path`. `None` when no mount matches (e.g. the path does not exist yet).
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// True when the target filesystem can absorb `size_delta` more bytes.
/// A non-positive delta (net shrink) always passes; an unresolvable mount
/// point is logged and treated as passing.
pub fn check_free_space(size_delta: i64, path: &Path) -> bool {
    if size_delta <= 0 {
        return true;
    }
    match available_space(path) {
        Some(available) => available > size_delta as u64,
        None => {
            warn!("could not determine free space for {}", path.display());
            true
        }
    }
}
