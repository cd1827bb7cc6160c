//! CDN path/URL helpers and case-insensitive filesystem resolution.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// CDN directory sharding for a chunk hash: `h[0:2]/h[2:4]/h`.
pub fn galaxy_path(h: &str) -> String {
    if h.len() < 4 {
        return h.to_string();
    }
    format!("{}/{}/{}", &h[..2], &h[2..4], h)
}

/// `Range` header value for a `size`-byte read at `offset` (inclusive end).
pub fn range_header(offset: u64, size: u64) -> String {
    format!("bytes={}-{}", offset, offset + size - 1)
}

/// Fill `{param}` placeholders in a secure-link URL template.
pub fn merge_url_with_params(
    url_format: &str,
    parameters: &HashMap<String, serde_json::Value>,
) -> String {
    let mut url = url_format.to_string();
    for (key, value) in parameters {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        url = url.replace(&format!("{{{key}}}"), &text);
    }
    url
}

/// Resolve `path` against the disk, matching each segment that does not
/// exist verbatim against the first directory entry with the same lowercase
/// name. Segments past the first level with no match at all are kept as
/// given (the tail of a path about to be created).
pub fn case_insensitive_path(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(name) if !resolved.as_os_str().is_empty() => {
                let exact = resolved.join(name);
                if exact.exists() || !resolved.exists() {
                    resolved = exact;
                    continue;
                }
                let wanted = name.to_string_lossy().to_lowercase();
                let matched = std::fs::read_dir(&resolved)
                    .ok()
                    .and_then(|entries| {
                        entries.flatten().map(|e| e.file_name()).find(|candidate| {
                            candidate.to_string_lossy().to_lowercase() == wanted
                        })
                    });
                match matched {
                    Some(actual) => resolved.push(actual),
                    None => resolved.push(name),
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

/// Create a directory tree a write target needs.
pub fn prepare_location(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Human-readable byte size.
pub fn readable_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
