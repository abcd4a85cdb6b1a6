//! Telegram-hosted file adapter
//!
//! Mirrors a file attached to a Telegram message. The attachment must be an
//! audio, video or document; anything else is rejected before a status is
//! registered. Bytes are fetched through a [`TelegramFileClient`]; the
//! bundled implementation uses the Bot API file endpoint via teloxide.

use crate::error::{MirrorError, Result, StorageErrorKind, CANCELED_BY_USER};
use crate::fsutil;
use crate::listener::MirrorListener;
use crate::protocol::{StatusType, TransferId};
use crate::status::{ListenerRef, MirrorStatus, TransferProgress};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teloxide::net::Download;
use teloxide::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Downloadable file attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub file_id: String,
    pub file_name: Option<String>,
    pub size: i64,
}

/// Attachment of the message a command replies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageMedia {
    Audio(MediaFile),
    Video(MediaFile),
    Document(MediaFile),
    /// Photos, stickers, voice notes and the like
    Unsupported(&'static str),
}

impl MessageMedia {
    /// The downloadable file, or `NotDownloadable`
    pub fn resolve(media: Option<&MessageMedia>) -> Result<&MediaFile> {
        match media {
            Some(Self::Audio(file) | Self::Video(file) | Self::Document(file)) => Ok(file),
            Some(Self::Unsupported(kind)) => Err(MirrorError::NotDownloadable(format!(
                "{} messages cannot be mirrored",
                kind
            ))),
            None => Err(MirrorError::NotDownloadable(
                "the message has no attachment".to_string(),
            )),
        }
    }

    /// `.nzb` documents go to the Usenet engine instead
    pub fn is_nzb(&self) -> bool {
        matches!(
            self,
            Self::Document(MediaFile { file_name: Some(name), .. })
                if name.to_ascii_lowercase().ends_with(".nzb")
        )
    }
}

/// Fetches Telegram-hosted files
#[async_trait]
pub trait TelegramFileClient: Send + Sync {
    /// Download `file_id` to `dest`, reporting into `progress`
    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Read a (small) file fully into memory
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// Bot-token client; the Bot API serves files up to 20 MB
#[derive(Clone)]
pub struct BotFileClient {
    bot: Bot,
}

impl BotFileClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn file_path(&self, file_id: &str) -> Result<(String, i64)> {
        let file = self
            .bot
            .get_file(file_id.to_string())
            .await
            .map_err(|e| MirrorError::engine("telegram", e.to_string()))?;
        Ok((file.path, file.meta.size as i64))
    }
}

#[async_trait]
impl TelegramFileClient for BotFileClient {
    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (path, size) = self.file_path(file_id).await?;
        if size > 0 {
            progress.set_total(size);
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            MirrorError::storage(
                StorageErrorKind::Io,
                dest,
                format!("Failed to create file: {}", e),
            )
        })?;
        let mut stream = self.bot.download_file_stream(&path);
        while let Some(chunk) = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(MirrorError::Canceled),
        } {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            progress.add_completed(chunk.len() as i64);
        }
        file.flush().await?;
        Ok(())
    }

    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>> {
        let (path, _) = self.file_path(file_id).await?;
        let mut stream = self.bot.download_file_stream(&path);
        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content)
    }
}

/// Adapter for Telegram attachments
pub struct TelegramDownloader {
    client: Arc<dyn TelegramFileClient>,
}

impl TelegramDownloader {
    pub fn new(client: Arc<dyn TelegramFileClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }

    pub fn client(&self) -> &Arc<dyn TelegramFileClient> {
        &self.client
    }

    pub async fn add_download(
        self: &Arc<Self>,
        media: Option<&MessageMedia>,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let file = MessageMedia::resolve(media)?.clone();
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;

        let gid = TransferId::new();
        let name = file
            .file_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("telegram_{}", gid.to_gid()));
        let dir = listener.dir();
        tokio::fs::create_dir_all(&dir).await?;
        let dest = fsutil::safe_join(&dir, &name)?;

        let progress = Arc::new(TransferProgress::new(name, file.size));
        let cancel = CancellationToken::new();
        let status = Arc::new(TelegramStatus {
            progress: progress.clone(),
            path: dest.clone(),
            gid,
            index: listener.index(),
            listener: listener_ref,
            cancel: cancel.clone(),
        });
        let gid = status.gid();
        listener
            .context()
            .registry
            .add(listener.uid(), status.clone());
        listener.on_download_start(&gid).await;

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.download(&file.file_id, &dest, &progress, &cancel).await {
                Ok(()) => listener.on_download_complete().await,
                Err(MirrorError::Canceled) => listener.on_download_error(CANCELED_BY_USER).await,
                Err(e) => {
                    tracing::warn!("Telegram download {} failed: {}", file.file_id, e);
                    listener.on_download_error(&e.to_string()).await;
                }
            }
        });
        Ok(gid)
    }
}

pub struct TelegramStatus {
    progress: Arc<TransferProgress>,
    path: PathBuf,
    gid: TransferId,
    index: u64,
    listener: ListenerRef,
    cancel: CancellationToken,
}

#[async_trait]
impl MirrorStatus for TelegramStatus {
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
        StatusType::Downloading
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        self.cancel.cancel();
        true
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }

    fn release(&self) {
        self.cancel.cancel();
    }
}
