//! Filesystem helpers for per-mirror download directories

use crate::error::{MirrorError, Result, StorageErrorKind};
use std::path::{Path, PathBuf};

/// Total size in bytes of a file or directory tree
pub async fn path_size(path: &Path) -> Result<i64> {
    let mut total = 0i64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        let meta = tokio::fs::symlink_metadata(&current)
            .await
            .map_err(|e| with_path(e, &current))?;
        if meta.is_dir() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| with_path(e, &current))?;
            while let Some(entry) = entries.next_entry().await? {
                stack.push(entry.path());
            }
        } else {
            total += meta.len() as i64;
        }
    }
    Ok(total)
}

/// Number of regular files below `path` (1 for a plain file)
pub async fn file_count(path: &Path) -> Result<usize> {
    let mut count = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        if tokio::fs::symlink_metadata(&current).await?.is_dir() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                stack.push(entry.path());
            }
        } else {
            count += 1;
        }
    }
    Ok(count)
}

/// Remove a file or directory tree; missing paths are not an error
pub async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(with_path(e, path)),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(with_path(e, path)),
    }
}

/// Join an engine-provided name under `root`, refusing to escape it
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if name.is_empty() || escapes {
        return Err(MirrorError::storage(
            StorageErrorKind::PathTraversal,
            root.join(name),
            "File name escapes the download directory",
        ));
    }
    Ok(root.join(candidate))
}

/// File or directory name for display
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn with_path(err: std::io::Error, path: &Path) -> MirrorError {
    match MirrorError::from(err) {
        MirrorError::Storage { kind, message, .. } => MirrorError::Storage {
            kind,
            path: path.to_path_buf(),
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_size_and_count() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![0u8; 100]).await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.bin"), vec![0u8; 50]).await.unwrap();

        assert_eq!(path_size(dir.path()).await.unwrap(), 150);
        assert_eq!(file_count(dir.path()).await.unwrap(), 2);
        assert_eq!(file_count(&dir.path().join("a.bin")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_path_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mirror");
        tokio::fs::create_dir_all(target.join("nested")).await.unwrap();

        remove_path(&target).await.unwrap();
        assert!(!target.exists());
        remove_path(&target).await.unwrap();
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/downloads/1_2");
        assert_eq!(safe_join(root, "file.iso").unwrap(), root.join("file.iso"));
        assert!(safe_join(root, "../etc/passwd").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "").is_err());
    }
}
