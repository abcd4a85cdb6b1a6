//! Mega adapter
//!
//! Mega downloads run inside a REST proxy wrapping the Mega SDK. The
//! adapter polls `GET /api/v1/downloads/{gid}` once a second. A gid the
//! proxy no longer knows is a failure, never an empty status.

use crate::engines::check_response;
use crate::error::{MirrorError, Result, CANCELED_BY_USER};
use crate::listener::MirrorListener;
use crate::protocol::StatusType;
use crate::status::{ListenerRef, MirrorStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MegaState {
    #[default]
    Queued,
    Active,
    Completed,
    Failed,
    Canceled,
}

/// Download record returned by the proxy
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MegaDownload {
    pub gid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: MegaState,
    #[serde(default)]
    pub total_length: i64,
    #[serde(default)]
    pub completed_length: i64,
    #[serde(default)]
    pub speed: i64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    link: &'a str,
    dir: &'a str,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    gid: String,
}

#[async_trait]
pub trait MegaApi: Send + Sync {
    async fn add(&self, link: &str, dir: &Path) -> Result<String>;
    /// Unknown gids are `NotFound`
    async fn status(&self, gid: &str) -> Result<MegaDownload>;
    async fn cancel(&self, gid: &str) -> Result<()>;
}

/// Mega REST proxy client
#[derive(Clone)]
pub struct MegaClient {
    base_url: String,
    http: Client,
}

impl MegaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/downloads{}", self.base_url, path)
    }
}

#[async_trait]
impl MegaApi for MegaClient {
    async fn add(&self, link: &str, dir: &Path) -> Result<String> {
        let dir = dir.to_string_lossy();
        let response = self
            .http
            .post(self.url(""))
            .json(&AddRequest { link, dir: &dir })
            .send()
            .await?;
        let added: AddResponse = check_response("mega", response).await?.json().await?;
        Ok(added.gid)
    }

    async fn status(&self, gid: &str) -> Result<MegaDownload> {
        let response = self.http.get(self.url(&format!("/{}", gid))).send().await?;
        Ok(check_response("mega", response).await?.json().await?)
    }

    async fn cancel(&self, gid: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/{}", gid)))
            .send()
            .await?;
        check_response("mega", response).await?;
        Ok(())
    }
}

/// Adapter for `mega.nz` links
pub struct MegaEngine {
    api: Arc<dyn MegaApi>,
    poll_interval: Duration,
}

impl MegaEngine {
    pub fn new(api: Arc<dyn MegaApi>) -> Arc<Self> {
        Self::with_poll_interval(api, Duration::from_secs(1))
    }

    pub fn with_poll_interval(api: Arc<dyn MegaApi>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self { api, poll_interval })
    }

    pub async fn add_download(
        self: &Arc<Self>,
        link: &str,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;
        let dir = listener.dir();
        tokio::fs::create_dir_all(&dir).await?;

        let gid = self.api.add(link, &dir).await?;
        let status = Arc::new(MegaStatus {
            api: self.api.clone(),
            last: RwLock::new(MegaDownload {
                gid: gid.clone(),
                ..Default::default()
            }),
            gid: gid.clone(),
            index: listener.index(),
            listener: listener_ref,
            dir,
            canceled: AtomicBool::new(false),
        });
        listener
            .context()
            .registry
            .add(listener.uid(), status.clone());
        listener.on_download_start(&gid).await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.poll(status, listener).await;
        });
        Ok(gid)
    }

    async fn poll(&self, status: Arc<MegaStatus>, listener: Arc<MirrorListener>) {
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

            let download = match self.api.status(&status.gid).await {
                Ok(download) => {
                    failures = 0;
                    download
                }
                Err(MirrorError::NotFound(_)) => {
                    listener
                        .on_download_error(&format!("Mega download {} not found", status.gid))
                        .await;
                    return;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("mega poll of {} failed ({}): {}", status.gid, failures, e);
                    if failures >= MAX_POLL_FAILURES {
                        listener.on_download_error(&e.to_string()).await;
                        return;
                    }
                    continue;
                }
            };
            let state = download.state;
            let error = download.error.clone();
            *status.last.write() = download;

            match state {
                MegaState::Completed => {
                    listener.on_download_complete().await;
                    return;
                }
                MegaState::Failed => {
                    let reason = error.unwrap_or_else(|| "Mega download failed".to_string());
                    listener.on_download_error(&reason).await;
                    return;
                }
                MegaState::Canceled => {
                    listener.on_download_error(CANCELED_BY_USER).await;
                    return;
                }
                MegaState::Queued | MegaState::Active => {}
            }
        }
    }
}

pub struct MegaStatus {
    api: Arc<dyn MegaApi>,
    gid: String,
    last: RwLock<MegaDownload>,
    index: u64,
    listener: ListenerRef,
    dir: PathBuf,
    canceled: AtomicBool,
}

#[async_trait]
impl MirrorStatus for MegaStatus {
    fn name(&self) -> String {
        let last = self.last.read();
        if last.name.is_empty() {
            self.gid.clone()
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
        self.gid.clone()
    }

    fn path(&self) -> PathBuf {
        let last = self.last.read();
        if last.name.is_empty() {
            self.dir.clone()
        } else {
            self.dir.join(&last.name)
        }
    }

    fn status_type(&self) -> StatusType {
        match self.last.read().state {
            MegaState::Queued => StatusType::Waiting,
            _ => StatusType::Downloading,
        }
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        if let Err(e) = self.api.cancel(&self.gid).await {
            tracing::warn!("mega cancel {} failed: {}", self.gid, e);
        }
        true
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_download() {
        let raw = json!({
            "gid": "m1",
            "name": "pack.zip",
            "state": "active",
            "total_length": 100,
            "completed_length": 40,
            "speed": 10
        });
        let download: MegaDownload = serde_json::from_value(raw).unwrap();
        assert_eq!(download.state, MegaState::Active);
        assert_eq!(download.completed_length, 40);
        assert!(download.error.is_none());
    }
}
