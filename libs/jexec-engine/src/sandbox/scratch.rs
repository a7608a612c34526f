use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Create the scratch root if needed and return its absolute path.
/// Docker bind mounts require absolute host paths.
pub fn prepare_root(root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create scratch root {}", root.display()))?;
    root.canonicalize()
        .with_context(|| format!("Failed to resolve scratch root {}", root.display()))
}

/// Uniquely named per-run directory under `root`, deleted when dropped
pub fn run_dir(root: &Path) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("run-")
        .tempdir_in(root)
        .with_context(|| format!("Failed to create scratch directory in {}", root.display()))?;
    debug!(path = %dir.path().display(), "Created scratch directory");
    Ok(dir)
}

/// `uid:gid` owning `path`, so a container can run as the same user
#[cfg(unix)]
pub fn owner(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .ok()
        .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
pub fn owner(_path: &Path) -> Option<String> {
    None
}
