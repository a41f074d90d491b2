//! Crash-safe file replacement
//!
//! Every on-disk unit of a run (node files, the lump file, the continuation
//! envelope and the run record) is replaced through [`write_atomic`]: the bytes
//! go to a sibling `*.tmp` file, are synced, and the temp file is renamed over
//! the destination. A reader therefore sees either the previous contents or
//! the new contents, never a prefix of the new ones.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Suffix used for in-flight writes. Loaders skip files carrying it.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Atomically replace `path` with `bytes`.
///
/// When `durable` is set the file is fsynced before the rename and the parent
/// directory afterwards, so the new contents survive power loss as well as a
/// killed process.
pub async fn write_atomic(path: &Path, bytes: &[u8], durable: bool) -> Result<()> {
    let tmp = temp_path(path);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    if durable {
        file.sync_all().await?;
    } else {
        file.flush().await?;
    }
    drop(file);

    fs::rename(&tmp, path).await?;

    if durable {
        if let Some(parent) = path.parent() {
            sync_dir(parent).await;
        }
    }
    Ok(())
}

/// Whether `path` names an in-flight temp file.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    // Directory fsync is not supported everywhere; the rename is already
    // visible to this process either way.
    if let Ok(handle) = fs::File::open(dir).await {
        if let Err(e) = handle.sync_all().await {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory sync not supported");
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        write_atomic(&path, b"first", true).await.unwrap();
        write_atomic(&path, b"second", false).await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_write_atomic_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("nodes");
        fs::write(&blocker, b"not a directory").await.unwrap();

        let result = write_atomic(&blocker.join("1.json"), b"{}", true).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_transient());
    }

    #[test]
    fn test_temp_file_detection() {
        assert!(is_temp_file(Path::new("/runs/a/nodes/4.json.tmp")));
        assert!(!is_temp_file(Path::new("/runs/a/nodes/4.json")));
    }
}
