//! Native HTTP(S) downloader
//!
//! Streams a direct link into the mirror's download directory through a
//! `.part` file, reporting progress into a [`TransferProgress`] and
//! honoring a cancellation token between chunks.

use crate::error::{MirrorError, NetworkErrorKind, Result, StorageErrorKind, CANCELED_BY_USER};
use crate::fsutil;
use crate::listener::MirrorListener;
use crate::protocol::{StatusType, TransferId};
use crate::status::{ListenerRef, MirrorStatus, TransferProgress};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use reqwest::{Client, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// HTTP downloader shared by every direct-link mirror
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("mirror-bot/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    /// Register a direct-link download for `listener` and start it
    ///
    /// Invalid links are rejected before anything is registered.
    pub async fn add_download(
        self: &Arc<Self>,
        link: &str,
        listener: Arc<MirrorListener>,
        filename: Option<String>,
    ) -> Result<String> {
        let url = Url::parse(link)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MirrorError::invalid_input(
                "url",
                format!("Unsupported scheme: {}", url.scheme()),
            ));
        }
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;

        let dir = listener.dir();
        let initial_name = filename
            .clone()
            .or_else(|| extract_filename_from_url(link))
            .unwrap_or_else(|| "download".to_string());
        let progress = Arc::new(TransferProgress::new(initial_name.clone(), 0));
        let cancel = CancellationToken::new();
        let status = Arc::new(HttpStatus {
            progress: progress.clone(),
            path: RwLock::new(dir.join(&initial_name)),
            gid: TransferId::new(),
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

        let this = Arc::clone(self);
        let link = link.to_string();
        tokio::spawn(async move {
            let result = this
                .download(&link, &dir, filename.as_deref(), &progress, &cancel)
                .await;
            match result {
                Ok(path) => {
                    *status.path.write() = path;
                    listener.on_download_complete().await;
                }
                Err(MirrorError::Canceled) => listener.on_download_error(CANCELED_BY_USER).await,
                Err(e) => {
                    tracing::warn!("HTTP download of {} failed: {}", link, e);
                    listener.on_download_error(&e.to_string()).await;
                }
            }
        });
        Ok(gid)
    }

    /// Download `url` into `save_dir`, returning the final path
    pub async fn download(
        &self,
        url: &str,
        save_dir: &Path,
        filename: Option<&str>,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let response = tokio::select! {
            response = self.client.get(url).send() => response?,
            _ = cancel.cancelled() => return Err(MirrorError::Canceled),
        };
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("HTTP error: {}", status),
            ));
        }

        let suggested = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);
        let final_name = filename
            .map(str::to_string)
            .or(suggested)
            .or_else(|| extract_filename_from_url(response.url().as_str()))
            .or_else(|| extract_filename_from_url(url))
            .unwrap_or_else(|| "download".to_string());
        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());

        progress.set_name(final_name.clone());
        if let Some(total) = total_size {
            progress.set_total(total);
        }

        tokio::fs::create_dir_all(save_dir).await.map_err(|e| {
            MirrorError::storage(
                StorageErrorKind::Io,
                save_dir,
                format!("Cannot create download directory: {}", e),
            )
        })?;
        let save_path = fsutil::safe_join(save_dir, &final_name)?;
        let part_path = save_dir.join(format!("{}.part", final_name));

        let file = File::create(&part_path).await.map_err(|e| {
            MirrorError::storage(
                StorageErrorKind::Io,
                &part_path,
                format!("Cannot create part file: {}", e),
            )
        })?;

        if let Err(e) = stream_to_file(response, file, total_size, progress, cancel).await {
            if let Err(cleanup) = tokio::fs::remove_file(&part_path).await {
                tracing::warn!("Failed to remove {:?}: {}", part_path, cleanup);
            }
            return Err(e);
        }

        tokio::fs::rename(&part_path, &save_path).await.map_err(|e| {
            MirrorError::storage(
                StorageErrorKind::Io,
                &save_path,
                format!("Cannot move finished download into place: {}", e),
            )
        })?;
        Ok(save_path)
    }
}

/// Stream a response body to `file`, stopping early on cancellation
async fn stream_to_file(
    response: Response,
    mut file: File,
    total_size: Option<i64>,
    progress: &TransferProgress,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut stream = response.bytes_stream();
    let mut received = 0i64;

    while let Some(chunk) = tokio::select! {
        chunk = stream.next() => chunk,
        _ = cancel.cancelled() => {
            file.flush().await.ok();
            return Err(MirrorError::Canceled);
        }
    } {
        let chunk = chunk.map_err(|e| {
            MirrorError::network(NetworkErrorKind::Other, format!("Stream error: {}", e))
        })?;
        file.write_all(&chunk).await?;
        received += chunk.len() as i64;
        progress.add_completed(chunk.len() as i64);
    }

    file.flush().await?;
    file.sync_all().await?;

    if let Some(expected) = total_size {
        if received < expected {
            return Err(MirrorError::network(
                NetworkErrorKind::Other,
                format!(
                    "Link closed early: got {} of {} bytes",
                    received, expected
                ),
            ));
        }
    }
    Ok(())
}

/// Status of a native HTTP download
pub struct HttpStatus {
    progress: Arc<TransferProgress>,
    path: RwLock<PathBuf>,
    gid: TransferId,
    index: u64,
    listener: ListenerRef,
    cancel: CancellationToken,
}

#[async_trait]
impl MirrorStatus for HttpStatus {
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
        self.path.read().clone()
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

/// File name announced by a `Content-Disposition` header
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            // RFC 5987 form wins over the plain one: charset'lang'percent-encoded
            "filename*" => {
                let encoded = value.trim().trim_matches('"');
                let encoded = encoded.rsplit("''").next().unwrap_or(encoded);
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    return Some(decoded.into_owned()).filter(|n| !n.is_empty());
                }
            }
            "filename" => {
                let name = value.trim().trim_matches('"');
                if !name.is_empty() {
                    plain = Some(name.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

/// Last non-empty path segment of `url`, percent-decoded
pub fn extract_filename_from_url(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_disposition() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"test.zip\""),
            Some("test.zip".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=test.zip"),
            Some("test.zip".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''na%C3%AFve.txt"),
            Some("naïve.txt".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=\"a.bin\"; filename*=UTF-8''b.bin"),
            Some("b.bin".to_string())
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_extract_filename_from_url() {
        assert_eq!(
            extract_filename_from_url("https://example.com/path/to/file%20name.zip"),
            Some("file name.zip".to_string())
        );
        assert_eq!(extract_filename_from_url("https://example.com/"), None);
    }
}
