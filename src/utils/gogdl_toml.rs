//! Load `.gogdl.toml` from the install root (CLI only). The library takes
//! options explicitly via `InstallOpts`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::types::InstallOpts;

#[derive(Debug, Deserialize)]
pub(crate) struct GogdlToml {
    #[serde(default)]
    install: InstallSection,
}

#[derive(Debug, Default, Deserialize)]
struct InstallSection {
    workers: Option<usize>,
    support_path: Option<String>,
    verbose: Option<bool>,
}

/// Load `.gogdl.toml` from `dir` if present. Returns None if the file is
/// missing or unreadable. CLI only.
pub(crate) fn load_gogdl_toml(dir: &Path) -> Option<GogdlToml> {
    let path = dir.join(".gogdl.toml");
    let s = std::fs::read_to_string(&path).ok()?;
    toml::from_str(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

/// Apply file config to opts (only fields present in the file). Returns the
/// file's verbose preference, if any, for the logger setup.
pub(crate) fn apply_file_to_opts(file: &GogdlToml, opts: &mut InstallOpts) -> Option<bool> {
    let section = &file.install;
    if let Some(workers) = section.workers {
        opts.workers = workers.max(1);
    }
    if let Some(ref p) = section.support_path {
        opts.support_path = Some(PathBuf::from(p));
    }
    section.verbose
}
