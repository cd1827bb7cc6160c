//! Delta-patcher seam. The delta binary format lives outside this crate;
//! the writer invokes whatever implementation the caller supplies.

use anyhow::Result;
use std::path::Path;

/// Applies a binary delta: `source` + `delta` -> `output`.
pub trait Patcher: Send + Sync {
    fn patch(&self, source: &Path, delta: &Path, output: &Path) -> Result<()>;
}
