//! Usenet adapter backed by NZBGet
//!
//! NZBs are submitted with `append` and tracked by their NZBID. A running
//! job lives in `listgroups`; once NZBGet finishes (or gives up) the job
//! moves to `history`, so the poller checks both. On success the job's
//! destination directory is moved into the mirror's own directory.
//!
//! Byte-identical NZBs are rejected while the first copy is still running.

use crate::config::NzbGetConfig;
use crate::error::{MirrorError, NetworkErrorKind, Result, CANCELED_BY_USER};
use crate::fsutil;
use crate::listener::MirrorListener;
use crate::protocol::StatusType;
use crate::status::{ListenerRef, MirrorStatus, TransferProgress};
use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_POLL_FAILURES: u32 = 3;

fn combine(lo: u32, hi: u32) -> i64 {
    ((hi as i64) << 32) | lo as i64
}

/// Entry of `listgroups`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NzbGroup {
    #[serde(rename = "NZBID")]
    pub nzb_id: i64,
    #[serde(rename = "NZBName", default)]
    pub nzb_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub file_size_lo: u32,
    #[serde(default)]
    pub file_size_hi: u32,
    #[serde(default)]
    pub remaining_size_lo: u32,
    #[serde(default)]
    pub remaining_size_hi: u32,
    #[serde(default)]
    pub dest_dir: String,
}

impl NzbGroup {
    pub fn total(&self) -> i64 {
        combine(self.file_size_lo, self.file_size_hi)
    }

    pub fn downloaded(&self) -> i64 {
        (self.total() - combine(self.remaining_size_lo, self.remaining_size_hi)).max(0)
    }
}

/// Entry of `history`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NzbHistory {
    #[serde(rename = "NZBID")]
    pub nzb_id: i64,
    #[serde(default)]
    pub name: String,
    /// `SUCCESS/...`, `FAILURE/...`, `WARNING/...` or `DELETED/...`
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub file_size_lo: u32,
    #[serde(default)]
    pub file_size_hi: u32,
    #[serde(default)]
    pub dest_dir: String,
}

impl NzbHistory {
    pub fn total(&self) -> i64 {
        combine(self.file_size_lo, self.file_size_hi)
    }
}

/// NZBGet JSON-RPC surface used by the adapter
#[async_trait]
pub trait NzbGetApi: Send + Sync {
    /// Queue an NZB, returning its NZBID
    async fn append(&self, name: &str, content: &[u8]) -> Result<i64>;
    async fn list_groups(&self) -> Result<Vec<NzbGroup>>;
    async fn history(&self) -> Result<Vec<NzbHistory>>;
    /// Delete a queued job and its files
    async fn delete(&self, nzb_id: i64) -> Result<()>;
}

/// NZBGet JSON-RPC client
#[derive(Clone)]
pub struct NzbGetClient {
    endpoint: String,
    username: String,
    password: String,
    http: Client,
}

impl NzbGetClient {
    pub fn new(config: &NzbGetConfig) -> Self {
        Self {
            endpoint: format!("{}/jsonrpc", config.rpc_url.trim_end_matches('/')),
            username: config.username.clone(),
            password: config.password.clone(),
            http: Client::new(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = json!({
            "version": "1.1",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("NZBGet {} failed: {}", method, status),
            ));
        }
        let payload: Value = response.json().await?;
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(MirrorError::engine("nzbget", message));
        }
        let result = payload
            .get("result")
            .cloned()
            .ok_or_else(|| MirrorError::engine("nzbget", "invalid response: missing result"))?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl NzbGetApi for NzbGetClient {
    async fn append(&self, name: &str, content: &[u8]) -> Result<i64> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let id: i64 = self
            .call(
                "append",
                json!([name, encoded, "", 0, false, false, "", 0, "SCORE", []]),
            )
            .await?;
        if id <= 0 {
            return Err(MirrorError::engine("nzbget", format!("{} was rejected", name)));
        }
        Ok(id)
    }

    async fn list_groups(&self) -> Result<Vec<NzbGroup>> {
        self.call("listgroups", json!([0])).await
    }

    async fn history(&self) -> Result<Vec<NzbHistory>> {
        self.call("history", json!([false])).await
    }

    async fn delete(&self, nzb_id: i64) -> Result<()> {
        let ok: bool = self
            .call("editqueue", json!(["GroupFinalDelete", "", [nzb_id]]))
            .await?;
        if !ok {
            return Err(MirrorError::engine("nzbget", format!("could not delete {}", nzb_id)));
        }
        Ok(())
    }
}

/// Hex SHA-256 of NZB content, the dedup key
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Adapter for `.nzb` mirrors
pub struct UsenetEngine {
    api: Arc<dyn NzbGetApi>,
    http: Client,
    running: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl UsenetEngine {
    pub fn new(api: Arc<dyn NzbGetApi>) -> Arc<Self> {
        Self::with_poll_interval(api, Duration::from_secs(1))
    }

    pub fn with_poll_interval(api: Arc<dyn NzbGetApi>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            api,
            http: Client::new(),
            running: Mutex::new(HashSet::new()),
            poll_interval,
        })
    }

    /// Number of NZBs currently being downloaded
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Fetch an NZB over HTTP and submit it
    pub async fn add_link(
        self: &Arc<Self>,
        link: &str,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let response = self.http.get(link).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("Failed to fetch NZB: {}", status),
            ));
        }
        let name = super::http::extract_filename_from_url(link)
            .unwrap_or_else(|| "download.nzb".to_string());
        let content = response.bytes().await?;
        self.add_download(&name, &content, listener).await
    }

    /// Submit NZB `content` for `listener`
    pub async fn add_download(
        self: &Arc<Self>,
        name: &str,
        content: &[u8],
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;

        let digest = content_digest(content);
        if !self.running.lock().insert(digest.clone()) {
            return Err(MirrorError::AlreadyExists(format!(
                "{} is already being downloaded",
                name
            )));
        }
        let nzb_id = match self.api.append(name, content).await {
            Ok(id) => id,
            Err(e) => {
                self.running.lock().remove(&digest);
                return Err(e);
            }
        };

        let display = name.strip_suffix(".nzb").unwrap_or(name).to_string();
        let status = Arc::new(UsenetStatus {
            api: self.api.clone(),
            progress: Arc::new(TransferProgress::new(display.clone(), 0)),
            nzb_id,
            path: RwLock::new(listener.dir().join(&display)),
            queued: AtomicBool::new(true),
            index: listener.index(),
            listener: listener_ref,
            canceled: AtomicBool::new(false),
        });
        let gid = status.gid();
        listener
            .context()
            .registry
            .add(listener.uid(), status.clone());
        listener.on_download_start(&gid).await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.poll(status, listener).await;
            engine.running.lock().remove(&digest);
        });
        Ok(gid)
    }

    async fn poll(&self, status: Arc<UsenetStatus>, listener: Arc<MirrorListener>) {
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

            match self.lookup(status.nzb_id).await {
                Ok(Lookup::Running(group)) => {
                    failures = 0;
                    status.observe(&group);
                }
                Ok(Lookup::Finished(entry)) => {
                    self.finish(&status, &listener, entry).await;
                    return;
                }
                Ok(Lookup::Missing) => {
                    let reason = format!("NZB {} disappeared from NZBGet", status.nzb_id);
                    listener.on_download_error(&reason).await;
                    return;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("NZBGet poll of {} failed ({}): {}", status.nzb_id, failures, e);
                    if failures >= MAX_POLL_FAILURES {
                        listener.on_download_error(&e.to_string()).await;
                        return;
                    }
                }
            }
        }
    }

    /// Queue first, history second
    async fn lookup(&self, nzb_id: i64) -> Result<Lookup> {
        if let Some(group) = self
            .api
            .list_groups()
            .await?
            .into_iter()
            .find(|g| g.nzb_id == nzb_id)
        {
            return Ok(Lookup::Running(group));
        }
        Ok(self
            .api
            .history()
            .await?
            .into_iter()
            .find(|h| h.nzb_id == nzb_id)
            .map(Lookup::Finished)
            .unwrap_or(Lookup::Missing))
    }

    async fn finish(&self, status: &UsenetStatus, listener: &MirrorListener, entry: NzbHistory) {
        if entry.status.starts_with("DELETED") {
            listener.on_download_error(CANCELED_BY_USER).await;
            return;
        }
        if !entry.status.starts_with("SUCCESS") {
            listener
                .on_download_error(&format!("NZBGet reported {}", entry.status))
                .await;
            return;
        }

        status.progress.set_total(entry.total());
        status.progress.set_completed(entry.total());
        match move_into(&PathBuf::from(&entry.dest_dir), &listener.dir()).await {
            Ok(path) => {
                *status.path.write() = path;
                listener.on_download_complete().await;
            }
            Err(e) => {
                tracing::warn!("Failed to move {} into place: {}", entry.dest_dir, e);
                listener.on_download_error(&e.to_string()).await;
            }
        }
    }
}

enum Lookup {
    Running(NzbGroup),
    Finished(NzbHistory),
    Missing,
}

/// Move `source` under `dir`, keeping its file name
async fn move_into(source: &std::path::Path, dir: &std::path::Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = fsutil::display_name(source);
    let target = fsutil::safe_join(dir, &name)?;
    tokio::fs::rename(source, &target).await?;
    Ok(target)
}

/// Status of an NZBGet job
pub struct UsenetStatus {
    api: Arc<dyn NzbGetApi>,
    progress: Arc<TransferProgress>,
    nzb_id: i64,
    path: RwLock<PathBuf>,
    queued: AtomicBool,
    index: u64,
    listener: ListenerRef,
    canceled: AtomicBool,
}

impl UsenetStatus {
    fn observe(&self, group: &NzbGroup) {
        if !group.nzb_name.is_empty() {
            self.progress.set_name(group.nzb_name.clone());
        }
        self.progress.set_total(group.total());
        self.progress.set_completed(group.downloaded());
        self.queued
            .store(group.status == "QUEUED" || group.status == "PAUSED", Ordering::SeqCst);
    }
}

#[async_trait]
impl MirrorStatus for UsenetStatus {
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
        format!("nzb{}", self.nzb_id)
    }

    fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    fn status_type(&self) -> StatusType {
        if self.queued.load(Ordering::SeqCst) {
            StatusType::Waiting
        } else {
            StatusType::Downloading
        }
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        if let Err(e) = self.api.delete(self.nzb_id).await {
            tracing::warn!("NZBGet delete {} failed: {}", self.nzb_id, e);
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

    #[test]
    fn test_group_sizes() {
        let raw = json!({
            "NZBID": 7,
            "NZBName": "Some.Release",
            "Status": "DOWNLOADING",
            "FileSizeLo": 0,
            "FileSizeHi": 1,
            "RemainingSizeLo": 1024,
            "RemainingSizeHi": 0,
            "DestDir": "/nzbget/inter/Some.Release.#7"
        });
        let group: NzbGroup = serde_json::from_value(raw).unwrap();
        assert_eq!(group.nzb_id, 7);
        assert_eq!(group.total(), 1 << 32);
        assert_eq!(group.downloaded(), (1 << 32) - 1024);
    }

    #[test]
    fn test_history_parse() {
        let raw = json!({
            "NZBID": 7,
            "Name": "Some.Release",
            "Status": "SUCCESS/UNPACK",
            "FileSizeLo": 2048,
            "FileSizeHi": 0,
            "DestDir": "/nzbget/complete/Some.Release"
        });
        let entry: NzbHistory = serde_json::from_value(raw).unwrap();
        assert!(entry.status.starts_with("SUCCESS"));
        assert_eq!(entry.total(), 2048);
    }

    #[test]
    fn test_content_digest_is_stable() {
        let a = content_digest(b"<nzb></nzb>");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_digest(b"<nzb></nzb>"));
        assert_ne!(a, content_digest(b"<nzb> </nzb>"));
    }
}
