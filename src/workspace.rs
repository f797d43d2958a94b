//! Private scratch directories for pipeline runs.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::JobError;

const WORKSPACE_PREFIX: &str = "unit-";

/// Run `f` inside a fresh, empty directory under `root`. The directory is
/// removed when `f` returns, fails or panics.
pub fn with_workspace<T, F>(root: &Path, f: F) -> Result<T, JobError>
where
    F: FnOnce(&Path) -> Result<T, JobError>,
{
    fs::create_dir_all(root)
        .map_err(|e| JobError::internal(format!("create workspace root {}: {e}", root.display())))?;
    let dir = tempfile::Builder::new()
        .prefix(WORKSPACE_PREFIX)
        .tempdir_in(root)
        .map_err(|e| JobError::internal(format!("allocate workspace in {}: {e}", root.display())))?;

    debug!(workspace = %dir.path().display(), "workspace allocated");
    let result = f(dir.path());

    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(workspace = %path.display(), "failed to remove workspace: {e}");
    }
    result
}

/// Remove workspaces older than `max_age`, left behind when a run was killed
/// before its scopes could close. Returns how many were removed.
pub fn sweep_stale(root: &Path, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_workspace = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(WORKSPACE_PREFIX))
            .unwrap_or(false);
        if !is_workspace || !path.is_dir() {
            continue;
        }
        let old = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .map(|age| age >= max_age)
            .unwrap_or(false);
        if old && fs::remove_dir_all(&path).is_ok() {
            debug!(workspace = %path.display(), "removed stale workspace");
            removed += 1;
        }
    }
    removed
}
