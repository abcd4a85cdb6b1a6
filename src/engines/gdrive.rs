//! Google Drive uploads and clones
//!
//! [`CloudStorage`] is the upload/clone contract the listener depends on.
//! [`DriveClient`] implements it over the Drive v3 REST API with resumable
//! chunked uploads, recursive folder handling and copy-based clones.
//! Rate-limited calls are retried with a fixed attempt budget and a fixed
//! backoff sleep.

use crate::config::{DriveConfig, RetryConfig};
use crate::error::{MirrorError, NetworkErrorKind, Result};
use crate::fsutil;
use crate::listener::CloneListener;
use crate::protocol::{StatusType, TransferId};
use crate::status::{ListenerRef, MirrorStatus, TransferProgress};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncReadExt;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size";

/// Result of an upload or clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudItem {
    pub id: String,
    pub name: String,
    pub link: String,
    pub size: i64,
    pub is_folder: bool,
    /// Files contained (1 for a plain file)
    pub files: usize,
}

/// Metadata of an existing cloud item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMetadata {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub is_folder: bool,
}

/// Cloud storage backend for uploads and server-side clones
#[async_trait]
pub trait CloudStorage: Send + Sync {
    async fn metadata(&self, id: &str) -> Result<CloudMetadata>;

    /// Upload a file or directory tree into `parent_id`
    async fn upload(
        &self,
        path: &Path,
        parent_id: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<CloudItem>;

    /// Copy an existing item into `parent_id` without downloading it
    async fn clone_item(
        &self,
        id: &str,
        parent_id: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<CloudItem>;
}

/// Extract a Drive file or folder id from a share link
pub fn extract_file_id(link: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(r"(?:/d/|/folders/|[?&]id=)([-\w]{10,})").ok()
        })
        .as_ref()?;
    pattern
        .captures(link)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether `link` points at Google Drive
pub fn is_drive_link(link: &str) -> bool {
    link.contains("drive.google.com") || link.contains("docs.google.com")
}

/// Share link for a Drive item
pub fn drive_link(id: &str, is_folder: bool) -> String {
    if is_folder {
        format!("https://drive.google.com/drive/folders/{}", id)
    } else {
        format!("https://drive.google.com/file/d/{}/view?usp=drivesdk", id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    fn size(&self) -> i64 {
        self.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorBody {
    error: DriveErrorDetail,
}

#[derive(Debug, Deserialize)]
struct DriveErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<DriveErrorReason>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorReason {
    #[serde(default)]
    reason: String,
}

/// Drive v3 REST client
pub struct DriveClient {
    http: Client,
    config: DriveConfig,
    retry: RetryConfig,
}

impl DriveClient {
    pub fn new(config: DriveConfig, retry: RetryConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("mirror-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            config,
            retry,
        })
    }

    /// Turn an error response into a classified error
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let (message, reasons) = match serde_json::from_str::<DriveErrorBody>(&body) {
            Ok(parsed) => (
                parsed.error.message,
                parsed
                    .error
                    .errors
                    .into_iter()
                    .map(|e| e.reason)
                    .collect::<Vec<_>>(),
            ),
            Err(_) => (body, Vec::new()),
        };
        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || reasons
                .iter()
                .any(|r| r == "userRateLimitExceeded" || r == "rateLimitExceeded");
        let kind = if rate_limited {
            NetworkErrorKind::RateLimited
        } else if status == StatusCode::NOT_FOUND {
            return Err(MirrorError::NotFound(message));
        } else {
            NetworkErrorKind::HttpStatus(status.as_u16())
        };
        Err(MirrorError::network(kind, message))
    }

    /// Retry `op` while it fails with a retryable error
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        "Drive {} failed (attempt {}), retrying in {:?}: {}",
                        what,
                        attempt,
                        self.retry.backoff,
                        e
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_file(&self, id: &str) -> Result<DriveFile> {
        self.with_retry("metadata", move || async move {
            let response = self
                .http
                .get(format!("{}/files/{}", self.config.api_base, id))
                .bearer_auth(&self.config.access_token)
                .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                .send()
                .await?;
            Ok(Self::check(response).await?.json::<DriveFile>().await?)
        })
        .await
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        let query = format!("'{}' in parents and trashed = false", folder_id);
        let corpora = if self.config.is_team_drive {
            "allDrives"
        } else {
            "user"
        };
        loop {
            let token = page_token.clone();
            let query = query.as_str();
            let page: FileList = self
                .with_retry("list", move || {
                    let token = token.clone();
                    async move {
                        let mut request = self
                            .http
                            .get(format!("{}/files", self.config.api_base))
                            .bearer_auth(&self.config.access_token)
                            .query(&[
                                ("q", query),
                                ("fields", "nextPageToken,files(id,name,mimeType,size)"),
                                ("pageSize", "1000"),
                                ("supportsAllDrives", "true"),
                                ("includeItemsFromAllDrives", "true"),
                                ("corpora", corpora),
                            ]);
                        if let Some(token) = token {
                            request = request.query(&[("pageToken", token)]);
                        }
                        Ok(Self::check(request.send().await?).await?.json().await?)
                    }
                })
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        self.with_retry("create folder", move || async move {
            let response = self
                .http
                .post(format!("{}/files", self.config.api_base))
                .bearer_auth(&self.config.access_token)
                .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                .json(&json!({
                    "name": name,
                    "mimeType": FOLDER_MIME,
                    "parents": [parent_id],
                }))
                .send()
                .await?;
            Ok(Self::check(response).await?.json::<DriveFile>().await?)
        })
        .await
    }

    async fn upload_file(
        &self,
        path: &Path,
        parent_id: &str,
        progress: &TransferProgress,
    ) -> Result<DriveFile> {
        let name = fsutil::display_name(path);
        let name = name.as_str();
        let total = tokio::fs::metadata(path).await?.len();

        let session = self
            .with_retry("upload session", move || async move {
                let response = self
                    .http
                    .post(format!("{}/files", self.config.upload_base))
                    .bearer_auth(&self.config.access_token)
                    .query(&[
                        ("uploadType", "resumable"),
                        ("supportsAllDrives", "true"),
                        ("fields", FILE_FIELDS),
                    ])
                    .header("X-Upload-Content-Length", total)
                    .json(&json!({ "name": name, "parents": [parent_id] }))
                    .send()
                    .await?;
                let response = Self::check(response).await?;
                response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        MirrorError::network(
                            NetworkErrorKind::InvalidResponse,
                            "Upload session has no location",
                        )
                    })
            })
            .await?;
        let session = session.as_str();

        if total == 0 {
            let response = self
                .http
                .put(session)
                .header(CONTENT_RANGE, "bytes */0")
                .body(Vec::new())
                .send()
                .await?;
            return Ok(Self::check(response).await?.json().await?);
        }

        let mut file = tokio::fs::File::open(path).await?;
        let mut offset = 0u64;
        loop {
            let len = (self.config.chunk_size as u64).min(total - offset) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            let chunk = Bytes::from(buf);
            let range = format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total);

            let response = self
                .with_retry("upload chunk", move || {
                    let chunk = chunk.clone();
                    let range = range.clone();
                    async move {
                        let response = self
                            .http
                            .put(session)
                            .header(CONTENT_RANGE, range)
                            .body(chunk)
                            .send()
                            .await?;
                        // 308 means the chunk landed and more are expected
                        if response.status() == StatusCode::PERMANENT_REDIRECT {
                            return Ok(None);
                        }
                        Ok(Some(Self::check(response).await?))
                    }
                })
                .await?;

            offset += len as u64;
            progress.add_completed(len as i64);
            if let Some(response) = response {
                return Ok(response.json().await?);
            }
            if offset >= total {
                return Err(MirrorError::network(
                    NetworkErrorKind::InvalidResponse,
                    "Upload session did not finalize",
                ));
            }
        }
    }

    /// Upload a directory tree; returns the folder and the number of files
    fn upload_dir<'a>(
        &'a self,
        path: &'a Path,
        parent_id: &'a str,
        progress: &'a TransferProgress,
    ) -> BoxFuture<'a, Result<(DriveFile, usize)>> {
        async move {
            let folder = self
                .create_folder(&fsutil::display_name(path), parent_id)
                .await?;
            let mut entries = tokio::fs::read_dir(path).await?;
            let mut children = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();

            let mut files = 0;
            for child in children {
                if tokio::fs::metadata(&child).await?.is_dir() {
                    let (_, count) = self.upload_dir(&child, &folder.id, progress).await?;
                    files += count;
                } else {
                    self.upload_file(&child, &folder.id, progress).await?;
                    files += 1;
                }
            }
            Ok((folder, files))
        }
        .boxed()
    }

    async fn copy_file(&self, file: &DriveFile, parent_id: &str) -> Result<DriveFile> {
        self.with_retry("copy", move || async move {
            let response = self
                .http
                .post(format!("{}/files/{}/copy", self.config.api_base, file.id))
                .bearer_auth(&self.config.access_token)
                .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                .json(&json!({ "parents": [parent_id] }))
                .send()
                .await?;
            Ok(Self::check(response).await?.json::<DriveFile>().await?)
        })
        .await
    }

    /// Copy a folder tree; returns the new folder and the number of files
    fn clone_folder<'a>(
        &'a self,
        source: &'a DriveFile,
        parent_id: &'a str,
        progress: &'a TransferProgress,
    ) -> BoxFuture<'a, Result<(DriveFile, usize)>> {
        async move {
            let folder = self.create_folder(&source.name, parent_id).await?;
            let children = self.list_children(&source.id).await?;
            let discovered: i64 = children.iter().map(DriveFile::size).sum();
            progress.set_total(progress.total() + discovered);

            let mut files = 0;
            for child in &children {
                if child.is_folder() {
                    let (_, count) = self.clone_folder(child, &folder.id, progress).await?;
                    files += count;
                } else {
                    self.copy_file(child, &folder.id).await?;
                    progress.add_completed(child.size());
                    files += 1;
                }
            }
            Ok((folder, files))
        }
        .boxed()
    }
}

#[async_trait]
impl CloudStorage for DriveClient {
    async fn metadata(&self, id: &str) -> Result<CloudMetadata> {
        let file = self.get_file(id).await?;
        Ok(CloudMetadata {
            is_folder: file.is_folder(),
            size: file.size(),
            id: file.id,
            name: file.name,
        })
    }

    async fn upload(
        &self,
        path: &Path,
        parent_id: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<CloudItem> {
        let size = fsutil::path_size(path).await?;
        if tokio::fs::metadata(path).await?.is_dir() {
            let (folder, files) = self.upload_dir(path, parent_id, &progress).await?;
            Ok(CloudItem {
                link: drive_link(&folder.id, true),
                id: folder.id,
                name: folder.name,
                size,
                is_folder: true,
                files,
            })
        } else {
            let file = self.upload_file(path, parent_id, &progress).await?;
            Ok(CloudItem {
                link: drive_link(&file.id, false),
                size: file.size().max(size),
                id: file.id,
                name: file.name,
                is_folder: false,
                files: 1,
            })
        }
    }

    async fn clone_item(
        &self,
        id: &str,
        parent_id: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<CloudItem> {
        let source = self.get_file(id).await?;
        if source.is_folder() {
            let (folder, files) = self.clone_folder(&source, parent_id, &progress).await?;
            Ok(CloudItem {
                link: drive_link(&folder.id, true),
                id: folder.id,
                name: folder.name,
                size: progress.completed(),
                is_folder: true,
                files,
            })
        } else {
            let copy = self.copy_file(&source, parent_id).await?;
            progress.add_completed(source.size());
            Ok(CloudItem {
                link: drive_link(&copy.id, false),
                size: source.size(),
                id: copy.id,
                name: copy.name,
                is_folder: false,
                files: 1,
            })
        }
    }
}

/// Status of a cloud upload; reports `Waiting` until a permit is granted
pub struct UploadStatus {
    progress: Arc<TransferProgress>,
    path: PathBuf,
    gid: TransferId,
    index: u64,
    listener: ListenerRef,
    started: AtomicBool,
}

impl UploadStatus {
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
            started: AtomicBool::new(false),
        }
    }

    /// The upload holds a permit and is moving bytes
    pub fn set_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MirrorStatus for UploadStatus {
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
        if self.started.load(Ordering::SeqCst) {
            StatusType::Uploading
        } else {
            StatusType::Waiting
        }
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

/// Status of a server-side clone
pub struct CloneStatus {
    progress: Arc<TransferProgress>,
    gid: TransferId,
    index: u64,
    listener: ListenerRef,
}

impl CloneStatus {
    pub fn new(progress: Arc<TransferProgress>, index: u64, listener: ListenerRef) -> Self {
        Self {
            progress,
            gid: TransferId::new(),
            index,
            listener,
        }
    }
}

#[async_trait]
impl MirrorStatus for CloneStatus {
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
        PathBuf::new()
    }

    fn status_type(&self) -> StatusType {
        StatusType::Cloning
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

/// Start a clone of `file_id` into `parent_id` and drive `listener`
///
/// The metadata lookup happens before anything is registered; a bad id is
/// returned as an error and leaves the registry untouched.
pub async fn start_clone(
    listener: Arc<CloneListener>,
    cloud: Arc<dyn CloudStorage>,
    file_id: &str,
    parent_id: &str,
    custom_parent: bool,
) -> Result<String> {
    let meta = cloud.metadata(file_id).await?;
    let listener_ref = listener
        .listener_ref()
        .ok_or_else(|| MirrorError::Internal("clone listener dropped".to_string()))?;

    let progress = Arc::new(TransferProgress::new(
        meta.name.clone(),
        if meta.is_folder { 0 } else { meta.size },
    ));
    let status = Arc::new(CloneStatus::new(
        progress.clone(),
        listener.index(),
        listener_ref,
    ));
    let gid = status.gid();
    let ctx = listener.context().clone();
    ctx.registry.add(listener.uid(), status);
    listener.on_clone_start(&gid).await;

    let file_id = file_id.to_string();
    let parent_id = parent_id.to_string();
    tokio::spawn(async move {
        match cloud.clone_item(&file_id, &parent_id, progress).await {
            Ok(item) => listener.on_clone_complete(item, custom_parent).await,
            Err(e) => listener.on_clone_error(&e.to_string()).await,
        }
    });
    Ok(gid)
}
