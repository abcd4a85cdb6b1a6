//! Archive and extraction stage
//!
//! [`ArchiveTool`] packs a finished download into a tar archive or extracts
//! an archive before upload. [`ProcessArchiver`] shells out to `tar` and
//! `7z`; progress is the growing size of the output on disk.

use crate::error::{MirrorError, Result};
use crate::fsutil;
use crate::protocol::{StatusType, TransferId};
use crate::status::{ListenerRef, MirrorStatus, TransferProgress};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Extensions recognized as archives, longest first
const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.bz2", ".tar.gz", ".tar.xz", ".tbz2", ".tgz", ".txz", ".tar", ".zip", ".7z", ".rar",
    ".gz", ".bz2", ".xz", ".iso", ".wim", ".cab", ".lzma", ".arj", ".deb", ".rpm",
];

/// Archive/extract backend used by the listener
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Pack `source` into the tar archive `output`
    ///
    /// `output` may sit inside `source` when the download directory itself
    /// is being archived; it must not end up inside its own archive.
    async fn archive(
        &self,
        source: &Path,
        output: &Path,
        progress: Arc<TransferProgress>,
    ) -> Result<PathBuf>;

    /// Extract `archive` into a sibling directory and return that directory
    async fn extract(&self, archive: &Path, progress: Arc<TransferProgress>) -> Result<PathBuf>;
}

/// Strip a known archive extension, `None` if `name` is not an archive
pub fn archive_stem(name: &str) -> Option<&str> {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext) && lower.len() > ext.len())
        .map(|ext| &name[..name.len() - ext.len()])
}

pub fn is_archive(name: &str) -> bool {
    archive_stem(name).is_some()
}

/// Runs `tar` and `7z` child processes
#[derive(Debug, Clone)]
pub struct ProcessArchiver {
    tar_bin: PathBuf,
    sevenzip_bin: PathBuf,
    poll_interval: Duration,
}

impl Default for ProcessArchiver {
    fn default() -> Self {
        Self {
            tar_bin: PathBuf::from("tar"),
            sevenzip_bin: PathBuf::from("7z"),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ProcessArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command`, reporting the size of `output` until it exits
    async fn run(
        &self,
        mut command: Command,
        output: &Path,
        progress: &TransferProgress,
    ) -> Result<()> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MirrorError::engine("archiver", format!("failed to spawn: {}", e)))?;

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Ok(size) = fsutil::path_size(output).await {
                        progress.set_completed(size);
                    }
                }
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(MirrorError::engine(
                "archiver",
                format!("exited with {}: {}", status, detail),
            ));
        }
        if let Ok(size) = fsutil::path_size(output).await {
            progress.set_completed(size);
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveTool for ProcessArchiver {
    async fn archive(
        &self,
        source: &Path,
        output: &Path,
        progress: Arc<TransferProgress>,
    ) -> Result<PathBuf> {
        let output_name = fsutil::display_name(output);
        progress.set_name(output_name.clone());

        let mut command = Command::new(&self.tar_bin);
        command.arg("-cf").arg(output);
        if output.parent() == Some(source) {
            command
                .arg(format!("--exclude=./{}", output_name))
                .arg("-C")
                .arg(source)
                .arg(".");
        } else {
            let parent = source.parent().unwrap_or_else(|| Path::new("."));
            command
                .arg("-C")
                .arg(parent)
                .arg(fsutil::display_name(source));
        }
        self.run(command, output, &progress).await?;

        tracing::debug!("Archived {:?} into {:?}", source, output);
        Ok(output.to_path_buf())
    }

    async fn extract(&self, archive: &Path, progress: Arc<TransferProgress>) -> Result<PathBuf> {
        let name = fsutil::display_name(archive);
        let stem = archive_stem(&name).ok_or_else(|| {
            MirrorError::engine("archiver", format!("{} is not a supported archive", name))
        })?;
        let parent = archive.parent().unwrap_or_else(|| Path::new("."));
        let output = parent.join(stem);
        tokio::fs::create_dir_all(&output).await?;
        progress.set_name(stem);

        let mut command = Command::new(&self.sevenzip_bin);
        command.arg("x").arg(archive).arg(format!("-o{}", output.display())).arg("-y");
        if let Err(e) = self.run(command, &output, &progress).await {
            if let Err(cleanup) = fsutil::remove_path(&output).await {
                tracing::warn!("Failed to remove {:?}: {}", output, cleanup);
            }
            return Err(e);
        }

        tracing::debug!("Extracted {:?} into {:?}", archive, output);
        Ok(output)
    }
}

/// Status shown while a download is being archived
pub struct ArchiveStatus {
    progress: Arc<TransferProgress>,
    path: PathBuf,
    gid: TransferId,
    index: u64,
    listener: ListenerRef,
}

impl ArchiveStatus {
    pub fn new(
        progress: Arc<TransferProgress>,
        path: PathBuf,
        index: u64,
        listener: ListenerRef,
    ) -> Self {
        Self {
            progress,
            path,
            gid: TransferId::new(),
            index,
            listener,
        }
    }
}

#[async_trait]
impl MirrorStatus for ArchiveStatus {
    fn name(&self) -> String {
        self.progress.name()
    }

    fn completed_length(&self) -> i64 {
        self.progress.completed()
    }

    fn total_length(&self) -> i64 {
        self.progress.total()
    }

    fn speed(&self) -> i64 {
        self.progress.speed()
    }

    fn gid(&self) -> String {
        self.gid.to_gid()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn status_type(&self) -> StatusType {
        StatusType::Archiving
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        false
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }
}

/// Status shown while an archive is being extracted
pub struct UnarchiveStatus {
    progress: Arc<TransferProgress>,
    path: PathBuf,
    gid: TransferId,
    index: u64,
    listener: ListenerRef,
}

impl UnarchiveStatus {
    pub fn new(
        progress: Arc<TransferProgress>,
        path: PathBuf,
        index: u64,
        listener: ListenerRef,
    ) -> Self {
        Self {
            progress,
            path,
            gid: TransferId::new(),
            index,
            listener,
        }
    }
}

#[async_trait]
impl MirrorStatus for UnarchiveStatus {
    fn name(&self) -> String {
        self.progress.name()
    }

    fn completed_length(&self) -> i64 {
        self.progress.completed()
    }

    fn total_length(&self) -> i64 {
        self.progress.total()
    }

    fn speed(&self) -> i64 {
        self.progress.speed()
    }

    fn gid(&self) -> String {
        self.gid.to_gid()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn status_type(&self) -> StatusType {
        StatusType::UnArchiving
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        false
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_stem() {
        assert_eq!(archive_stem("movie.tar.gz"), Some("movie"));
        assert_eq!(archive_stem("Pack.ZIP"), Some("Pack"));
        assert_eq!(archive_stem("disc.iso"), Some("disc"));
        assert_eq!(archive_stem("notes.txt"), None);
        assert_eq!(archive_stem(".zip"), None);
        assert!(is_archive("a.7z"));
    }
}
