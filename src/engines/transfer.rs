//! Cloud transfer service adapter
//!
//! An out-of-process service that downloads from, uploads to and clones
//! within cloud storage. Every job is started with
//! `POST /api/v1/transfers` and then polled once a second. A failed poll
//! yields an all-zero record instead of an error, so the renderer keeps
//! working while the service is briefly unreachable; only a run of
//! consecutive failures ends the job.

use crate::engines::check_response;
use crate::engines::gdrive::{drive_link, CloudItem, CloudMetadata, CloudStorage};
use crate::error::{MirrorError, Result, CANCELED_BY_USER};
use crate::listener::MirrorListener;
use crate::protocol::StatusType;
use crate::status::{ListenerRef, MirrorStatus, TransferProgress};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_POLL_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    #[default]
    Download,
    Upload,
    Clone,
    Archive,
    Extract,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Finished item reported by the service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransferResult {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub files: usize,
    #[serde(default)]
    pub path: Option<String>,
}

/// Job record returned by the service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransferRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub transfer_type: TransferKind,
    #[serde(default)]
    pub state: TransferState,
    #[serde(default)]
    pub completed_length: i64,
    #[serde(default)]
    pub total_length: i64,
    #[serde(default)]
    pub speed: i64,
    #[serde(default)]
    pub result: Option<TransferResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferRecord {
    /// Map the job to the renderer's status type
    pub fn status_type(&self) -> StatusType {
        if self.state == TransferState::Queued {
            return StatusType::Waiting;
        }
        match self.transfer_type {
            TransferKind::Download => StatusType::Downloading,
            TransferKind::Upload => StatusType::Uploading,
            TransferKind::Clone => StatusType::Cloning,
            TransferKind::Archive => StatusType::Archiving,
            TransferKind::Extract => StatusType::UnArchiving,
            TransferKind::Unknown => StatusType::Waiting,
        }
    }
}

/// Job submission body
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub transfer_type: TransferKind,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    id: String,
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    is_folder: bool,
}

#[async_trait]
pub trait TransferApi: Send + Sync {
    async fn start(&self, request: &TransferRequest) -> Result<String>;
    async fn status(&self, id: &str) -> Result<TransferRecord>;
    async fn cancel(&self, id: &str) -> Result<()>;
    async fn metadata(&self, id: &str) -> Result<CloudMetadata>;
}

/// Transfer service REST client
#[derive(Clone)]
pub struct TransferClient {
    base_url: String,
    http: Client,
}

impl TransferClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }
}

#[async_trait]
impl TransferApi for TransferClient {
    async fn start(&self, request: &TransferRequest) -> Result<String> {
        let response = self
            .http
            .post(self.url("/transfers"))
            .json(request)
            .send()
            .await?;
        let started: StartResponse = check_response("transfer", response).await?.json().await?;
        Ok(started.id)
    }

    async fn status(&self, id: &str) -> Result<TransferRecord> {
        let response = self
            .http
            .get(self.url(&format!("/transfers/{}", id)))
            .send()
            .await?;
        Ok(check_response("transfer", response).await?.json().await?)
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/transfers/{}", id)))
            .send()
            .await?;
        check_response("transfer", response).await?;
        Ok(())
    }

    async fn metadata(&self, id: &str) -> Result<CloudMetadata> {
        let response = self
            .http
            .get(self.url(&format!("/metadata/{}", id)))
            .send()
            .await?;
        let meta: MetadataResponse = check_response("transfer", response).await?.json().await?;
        Ok(CloudMetadata {
            id: meta.id,
            name: meta.name,
            size: meta.size,
            is_folder: meta.is_folder,
        })
    }
}

/// Poll `id`, substituting a zero record when a poll fails
async fn poll_record(
    api: &dyn TransferApi,
    id: &str,
    failures: &mut u32,
) -> Result<TransferRecord> {
    match api.status(id).await {
        Ok(record) => {
            *failures = 0;
            Ok(record)
        }
        Err(e) => {
            *failures += 1;
            tracing::warn!("transfer poll of {} failed ({}): {}", id, failures, e);
            if *failures >= MAX_POLL_FAILURES {
                return Err(e);
            }
            Ok(TransferRecord::default())
        }
    }
}

/// Drive-link downloads through the transfer service
pub struct TransferEngine {
    api: Arc<dyn TransferApi>,
    poll_interval: Duration,
}

impl TransferEngine {
    pub fn new(api: Arc<dyn TransferApi>) -> Arc<Self> {
        Self::with_poll_interval(api, Duration::from_secs(1))
    }

    pub fn with_poll_interval(api: Arc<dyn TransferApi>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self { api, poll_interval })
    }

    pub fn api(&self) -> &Arc<dyn TransferApi> {
        &self.api
    }

    /// Download cloud item `file_id` into the mirror's directory
    pub async fn add_download(
        self: &Arc<Self>,
        file_id: &str,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;
        let meta = self.api.metadata(file_id).await?;
        let dir = listener.dir();

        let id = self
            .api
            .start(&TransferRequest {
                transfer_type: TransferKind::Download,
                source: file_id.to_string(),
                destination: dir.to_string_lossy().into_owned(),
            })
            .await?;

        let status = Arc::new(TransferStatus {
            api: self.api.clone(),
            last: RwLock::new(TransferRecord {
                id: id.clone(),
                name: meta.name.clone(),
                total_length: meta.size,
                ..Default::default()
            }),
            name: meta.name.clone(),
            id: id.clone(),
            path: dir.join(&meta.name),
            index: listener.index(),
            listener: listener_ref,
            canceled: AtomicBool::new(false),
        });
        listener
            .context()
            .registry
            .add(listener.uid(), status.clone());
        listener.on_download_start(&id).await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.poll(status, listener).await;
        });
        Ok(id)
    }

    async fn poll(&self, status: Arc<TransferStatus>, listener: Arc<MirrorListener>) {
        let mut failures = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if listener.is_canceled() {
                return;
            }
            if status.canceled.load(Ordering::SeqCst) {
                listener.on_download_error(CANCELED_BY_USER).await;
                return;
            }

            let record = match poll_record(self.api.as_ref(), &status.id, &mut failures).await {
                Ok(record) => record,
                Err(e) => {
                    listener.on_download_error(&e.to_string()).await;
                    return;
                }
            };
            let state = record.state;
            let error = record.error.clone();
            *status.last.write() = record;

            match state {
                TransferState::Completed => {
                    listener.on_download_complete().await;
                    return;
                }
                TransferState::Failed => {
                    let reason = error.unwrap_or_else(|| "transfer failed".to_string());
                    listener.on_download_error(&reason).await;
                    return;
                }
                TransferState::Canceled => {
                    listener.on_download_error(CANCELED_BY_USER).await;
                    return;
                }
                TransferState::Queued | TransferState::Running => {}
            }
        }
    }
}

/// Status of a download job in the transfer service
pub struct TransferStatus {
    api: Arc<dyn TransferApi>,
    id: String,
    name: String,
    last: RwLock<TransferRecord>,
    path: PathBuf,
    index: u64,
    listener: ListenerRef,
    canceled: AtomicBool,
}

#[async_trait]
impl MirrorStatus for TransferStatus {
    fn name(&self) -> String {
        let last = self.last.read();
        if last.name.is_empty() {
            self.name.clone()
        } else {
            last.name.clone()
        }
    }

    fn completed_length(&self) -> i64 {
        self.last.read().completed_length
    }

    fn total_length(&self) -> i64 {
        self.last.read().total_length
    }

    fn speed(&self) -> i64 {
        self.last.read().speed
    }

    fn gid(&self) -> String {
        self.id.clone()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn status_type(&self) -> StatusType {
        self.last.read().status_type()
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        if let Err(e) = self.api.cancel(&self.id).await {
            tracing::warn!("transfer cancel {} failed: {}", self.id, e);
        }
        true
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }
}

/// [`CloudStorage`] whose uploads and clones run in the transfer service
pub struct TransferCloud {
    api: Arc<dyn TransferApi>,
    poll_interval: Duration,
}

impl TransferCloud {
    pub fn new(api: Arc<dyn TransferApi>) -> Self {
        Self::with_poll_interval(api, Duration::from_secs(1))
    }

    pub fn with_poll_interval(api: Arc<dyn TransferApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    /// Start a job and follow it to the end, mirroring counters into `progress`
    async fn run(
        &self,
        request: TransferRequest,
        progress: &TransferProgress,
    ) -> Result<CloudItem> {
        let id = self.api.start(&request).await?;
        let mut failures = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let record = poll_record(self.api.as_ref(), &id, &mut failures).await?;
            if failures > 0 {
                continue;
            }
            if !record.name.is_empty() {
                progress.set_name(record.name.clone());
            }
            if record.total_length > 0 {
                progress.set_total(record.total_length);
            }
            progress.set_completed(record.completed_length);
            progress.set_speed(record.speed);

            match record.state {
                TransferState::Completed => {
                    let result = record.result.ok_or_else(|| {
                        let message = format!("job {} finished without a result", id);
                        MirrorError::engine("transfer", message)
                    })?;
                    return Ok(CloudItem {
                        link: drive_link(&result.id, result.is_folder),
                        id: result.id,
                        name: result.name,
                        size: result.size,
                        is_folder: result.is_folder,
                        files: result.files.max(1),
                    });
                }
                TransferState::Failed => {
                    return Err(MirrorError::engine(
                        "transfer",
                        record.error.unwrap_or_else(|| "transfer failed".to_string()),
                    ))
                }
                TransferState::Canceled => return Err(MirrorError::Canceled),
                TransferState::Queued | TransferState::Running => {}
            }
        }
    }
}

#[async_trait]
impl CloudStorage for TransferCloud {
    async fn metadata(&self, id: &str) -> Result<CloudMetadata> {
        self.api.metadata(id).await
    }

    async fn upload(
        &self,
        path: &Path,
        parent_id: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<CloudItem> {
        self.run(
            TransferRequest {
                transfer_type: TransferKind::Upload,
                source: path.to_string_lossy().into_owned(),
                destination: parent_id.to_string(),
            },
            &progress,
        )
        .await
    }

    async fn clone_item(
        &self,
        id: &str,
        parent_id: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<CloudItem> {
        self.run(
            TransferRequest {
                transfer_type: TransferKind::Clone,
                source: id.to_string(),
                destination: parent_id.to_string(),
            },
            &progress,
        )
        .await
    }
}
