//! aria2 adapter
//!
//! Talks to a running aria2c over JSON-RPC. The engine handle is shared by
//! every aria2 mirror and is not safe for concurrent callers, so all calls
//! go through one async mutex. A 1 s poller per transfer caches the latest
//! `tellStatus` for the renderer and detects the terminal state.

use crate::error::{MirrorError, Result, CANCELED_BY_USER};
use crate::listener::MirrorListener;
use crate::protocol::StatusType;
use crate::status::{ListenerRef, MirrorStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Consecutive failed polls tolerated before the mirror is failed
const MAX_POLL_FAILURES: u32 = 3;

/// Parse aria2's stringly-typed numbers
fn string_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    match Option::<String>::deserialize(d)? {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            serde::de::Error::custom(format!("expected a numeric string, got {:?}", raw))
        }),
    }
}

/// `tellStatus` result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2TaskStatus {
    pub gid: String,
    pub status: String,
    #[serde(default, deserialize_with = "string_i64")]
    pub total_length: i64,
    #[serde(default, deserialize_with = "string_i64")]
    pub completed_length: i64,
    #[serde(default, deserialize_with = "string_i64")]
    pub download_speed: i64,
    #[serde(default, deserialize_with = "string_i64")]
    pub connections: i64,
    #[serde(default, deserialize_with = "string_i64")]
    pub num_seeders: i64,
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub files: Vec<Aria2File>,
    #[serde(default)]
    pub bittorrent: Option<Aria2Bittorrent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2File {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2Bittorrent {
    #[serde(default)]
    pub info: Option<Aria2TorrentInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2TorrentInfo {
    #[serde(default)]
    pub name: String,
}

impl Aria2TaskStatus {
    /// Display name: torrent name, else the first file relative to `dir`
    pub fn name(&self) -> Option<String> {
        if let Some(name) = self
            .bittorrent
            .as_ref()
            .and_then(|b| b.info.as_ref())
            .map(|i| i.name.clone())
            .filter(|n| !n.is_empty())
        {
            return Some(name);
        }
        let first = self.files.first()?.path.as_str();
        if first.is_empty() {
            return None;
        }
        let relative = Path::new(first)
            .strip_prefix(&self.dir)
            .unwrap_or_else(|_| Path::new(first));
        relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
    }
}

/// JSON-RPC surface of aria2 used by the adapter
#[async_trait]
pub trait Aria2Rpc: Send + Sync {
    async fn add_uri(&self, uris: Vec<String>, options: Value) -> Result<String>;
    async fn tell_status(&self, gid: &str) -> Result<Aria2TaskStatus>;
    async fn force_remove(&self, gid: &str) -> Result<()>;
}

/// aria2 JSON-RPC client
#[derive(Clone)]
pub struct Aria2Client {
    endpoint: String,
    secret: Option<String>,
    http: Client,
}

impl Aria2Client {
    pub fn new(endpoint: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret,
            http: Client::new(),
        }
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        mut params: Vec<Value>,
    ) -> Result<T> {
        if let Some(secret) = &self.secret {
            params.insert(0, json!(format!("token:{}", secret)));
        }
        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        let payload: Value = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(MirrorError::engine("aria2", message));
        }
        let result = payload
            .get("result")
            .cloned()
            .ok_or_else(|| MirrorError::engine("aria2", "invalid response: missing result"))?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl Aria2Rpc for Aria2Client {
    async fn add_uri(&self, uris: Vec<String>, options: Value) -> Result<String> {
        self.call("aria2.addUri", vec![json!(uris), options]).await
    }

    async fn tell_status(&self, gid: &str) -> Result<Aria2TaskStatus> {
        self.call("aria2.tellStatus", vec![json!(gid)]).await
    }

    async fn force_remove(&self, gid: &str) -> Result<()> {
        let _: String = self.call("aria2.forceRemove", vec![json!(gid)]).await?;
        Ok(())
    }
}

/// Process-wide aria2 engine with serialized access
pub struct Aria2Engine {
    rpc: Arc<dyn Aria2Rpc>,
    lock: Mutex<()>,
    poll_interval: Duration,
}

impl Aria2Engine {
    pub fn new(rpc: Arc<dyn Aria2Rpc>) -> Arc<Self> {
        Self::with_poll_interval(rpc, Duration::from_secs(1))
    }

    pub fn with_poll_interval(rpc: Arc<dyn Aria2Rpc>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            lock: Mutex::new(()),
            poll_interval,
        })
    }

    async fn tell_status(&self, gid: &str) -> Result<Aria2TaskStatus> {
        let _guard = self.lock.lock().await;
        self.rpc.tell_status(gid).await
    }

    async fn force_remove(&self, gid: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.rpc.force_remove(gid).await
    }

    /// Hand `link` to aria2 and start polling it for `listener`
    pub async fn add_download(
        self: &Arc<Self>,
        link: &str,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;
        let dir = listener.dir();
        let options = json!({
            "dir": dir.to_string_lossy(),
            "seed-time": "0",
            "follow-torrent": "mem",
        });

        let gid = {
            let _guard = self.lock.lock().await;
            self.rpc.add_uri(vec![link.to_string()], options).await?
        };
        listener.set_torrent(link.starts_with("magnet:") || link.ends_with(".torrent"));

        let status = Arc::new(Aria2DownloadStatus::new(
            self.clone(),
            gid.clone(),
            listener.index(),
            listener_ref.clone(),
            dir.clone(),
        ));
        let ctx = listener.context().clone();
        ctx.registry.add(listener.uid(), status.clone());
        listener.on_download_start(&gid).await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.poll(status, listener, listener_ref, dir).await;
        });
        Ok(gid)
    }

    async fn poll(
        self: Arc<Self>,
        mut status: Arc<Aria2DownloadStatus>,
        listener: Arc<MirrorListener>,
        listener_ref: ListenerRef,
        dir: PathBuf,
    ) {
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

            let task = match self.tell_status(&status.gid).await {
                Ok(task) => {
                    failures = 0;
                    task
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("aria2 poll of {} failed ({}): {}", status.gid, failures, e);
                    if failures >= MAX_POLL_FAILURES {
                        listener.on_download_error(&e.to_string()).await;
                        return;
                    }
                    continue;
                }
            };
            status.update(task.clone());

            match task.status.as_str() {
                "complete" => {
                    if let Some(next) = task.followed_by.first() {
                        // Metadata or .torrent finished; the real payload continues under a new gid
                        tracing::info!("aria2 {} followed by {}", status.gid, next);
                        listener.set_torrent(true);
                        status = Arc::new(Aria2DownloadStatus::new(
                            self.clone(),
                            next.clone(),
                            listener.index(),
                            listener_ref.clone(),
                            dir.clone(),
                        ));
                        listener.context().registry.add(listener.uid(), status.clone());
                        continue;
                    }
                    listener.on_download_complete().await;
                    return;
                }
                "error" => {
                    let reason = task
                        .error_message
                        .unwrap_or_else(|| "aria2 reported an error".to_string());
                    listener.on_download_error(&reason).await;
                    return;
                }
                "removed" => {
                    listener.on_download_error(CANCELED_BY_USER).await;
                    return;
                }
                _ => {}
            }
        }
    }
}

/// Status of an aria2 transfer, refreshed by its poller
pub struct Aria2DownloadStatus {
    engine: Arc<Aria2Engine>,
    gid: String,
    task: RwLock<Aria2TaskStatus>,
    index: u64,
    listener: ListenerRef,
    dir: PathBuf,
    canceled: AtomicBool,
}

impl Aria2DownloadStatus {
    fn new(
        engine: Arc<Aria2Engine>,
        gid: String,
        index: u64,
        listener: ListenerRef,
        dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            task: RwLock::new(Aria2TaskStatus {
                gid: gid.clone(),
                ..Default::default()
            }),
            gid,
            index,
            listener,
            dir,
            canceled: AtomicBool::new(false),
        }
    }

    fn update(&self, task: Aria2TaskStatus) {
        *self.task.write() = task;
    }
}

#[async_trait]
impl MirrorStatus for Aria2DownloadStatus {
    fn name(&self) -> String {
        self.task.read().name().unwrap_or_else(|| self.gid.clone())
    }

    fn completed_length(&self) -> i64 {
        self.task.read().completed_length
    }

    fn total_length(&self) -> i64 {
        self.task.read().total_length
    }

    fn speed(&self) -> i64 {
        self.task.read().download_speed
    }

    fn gid(&self) -> String {
        self.gid.clone()
    }

    fn path(&self) -> PathBuf {
        match self.task.read().name() {
            Some(name) => self.dir.join(name),
            None => self.dir.clone(),
        }
    }

    fn status_type(&self) -> StatusType {
        match self.task.read().status.as_str() {
            "waiting" | "paused" => StatusType::Waiting,
            _ => StatusType::Downloading,
        }
    }

    fn is_torrent(&self) -> bool {
        self.task.read().bittorrent.is_some()
    }

    fn peers(&self) -> u32 {
        self.task.read().connections.max(0) as u32
    }

    fn seeders(&self) -> u32 {
        self.task.read().num_seeders.max(0) as u32
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        match self.engine.force_remove(&self.gid).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("aria2 forceRemove {} failed: {}", self.gid, e);
                false
            }
        }
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tell_status() {
        let raw = json!({
            "gid": "2089b05ecca3d829",
            "status": "active",
            "totalLength": "34896138",
            "completedLength": "1048576",
            "downloadSpeed": "524288",
            "connections": "4",
            "dir": "/downloads/1_2",
            "files": [{"path": "/downloads/1_2/ubuntu.iso"}]
        });
        let task: Aria2TaskStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(task.total_length, 34896138);
        assert_eq!(task.download_speed, 524288);
        assert_eq!(task.name().as_deref(), Some("ubuntu.iso"));
        assert!(task.followed_by.is_empty());
    }

    #[test]
    fn test_torrent_name_wins() {
        let raw = json!({
            "gid": "1",
            "status": "complete",
            "dir": "/d",
            "files": [{"path": "/d/Show/ep1.mkv"}],
            "bittorrent": {"info": {"name": "Show"}},
            "followedBy": ["2"]
        });
        let task: Aria2TaskStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(task.name().as_deref(), Some("Show"));
        assert_eq!(task.followed_by, vec!["2".to_string()]);
    }
}
