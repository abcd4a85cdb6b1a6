//! Remote torrent service ("kedge") adapter
//!
//! kedge runs torrents out of process and exposes them over REST. There is
//! no push notification, so each mirror polls `GET /api/v1/torrents/{hash}`
//! once a second. kedge forgets a torrent as soon as it is removed, so the
//! status freezes its last observation on cancel instead of going blank.

use crate::config::SeedConfig;
use crate::engines::{check_response, seed_summary};
use crate::error::{MirrorError, Result, CANCELED_BY_USER};
use crate::fsutil;
use crate::listener::MirrorListener;
use crate::protocol::StatusType;
use crate::status::{self, ListenerRef, MirrorStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_POLL_FAILURES: u32 = 3;

/// Torrent state as reported by kedge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KedgeState {
    #[default]
    Queued,
    CheckingMetadata,
    Downloading,
    Seeding,
    Finished,
    Error,
}

/// `GET /api/v1/torrents/{hash}` body
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KedgeTorrent {
    pub hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: KedgeState,
    #[serde(default)]
    pub total_length: i64,
    #[serde(default)]
    pub completed_length: i64,
    #[serde(default)]
    pub download_speed: i64,
    #[serde(default)]
    pub upload_speed: i64,
    #[serde(default)]
    pub uploaded: i64,
    #[serde(default)]
    pub peers: u32,
    #[serde(default)]
    pub seeders: u32,
    /// Seconds spent seeding
    #[serde(default)]
    pub seeding_time: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl KedgeTorrent {
    pub fn ratio(&self) -> f64 {
        if self.total_length <= 0 {
            return 0.0;
        }
        self.uploaded as f64 / self.total_length as f64
    }

    pub fn seeding_time(&self) -> Duration {
        Duration::from_secs(self.seeding_time)
    }
}

#[derive(Debug, Serialize)]
struct AddTorrentRequest<'a> {
    link: &'a str,
    dir: &'a str,
    seed: bool,
}

#[derive(Debug, Deserialize)]
struct AddTorrentResponse {
    hash: String,
}

/// REST surface of kedge used by the adapter
#[async_trait]
pub trait KedgeApi: Send + Sync {
    /// Start a torrent; a torrent already known to kedge is `AlreadyExists`
    async fn add(&self, link: &str, dir: &Path, seed: bool) -> Result<String>;
    async fn status(&self, hash: &str) -> Result<KedgeTorrent>;
    /// Drop the torrent, keeping downloaded files
    async fn remove(&self, hash: &str) -> Result<()>;
}

/// kedge REST client
#[derive(Clone)]
pub struct KedgeClient {
    base_url: String,
    http: Client,
}

impl KedgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/torrents{}", self.base_url, path)
    }
}

#[async_trait]
impl KedgeApi for KedgeClient {
    async fn add(&self, link: &str, dir: &Path, seed: bool) -> Result<String> {
        let dir = dir.to_string_lossy();
        let response = self
            .http
            .post(self.url(""))
            .json(&AddTorrentRequest {
                link,
                dir: &dir,
                seed,
            })
            .send()
            .await?;
        let added: AddTorrentResponse = check_response("kedge", response).await?.json().await?;
        Ok(added.hash)
    }

    async fn status(&self, hash: &str) -> Result<KedgeTorrent> {
        let response = self.http.get(self.url(&format!("/{}", hash))).send().await?;
        Ok(check_response("kedge", response).await?.json().await?)
    }

    async fn remove(&self, hash: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/{}", hash)))
            .query(&[("delete_files", "false")])
            .send()
            .await?;
        check_response("kedge", response).await?;
        Ok(())
    }
}

/// Adapter for mirrors whose torrent runs inside kedge
pub struct KedgeEngine {
    api: Arc<dyn KedgeApi>,
    seed: SeedConfig,
    poll_interval: Duration,
}

impl KedgeEngine {
    pub fn new(api: Arc<dyn KedgeApi>, seed: SeedConfig) -> Arc<Self> {
        Self::with_poll_interval(api, seed, Duration::from_secs(1))
    }

    pub fn with_poll_interval(
        api: Arc<dyn KedgeApi>,
        seed: SeedConfig,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            seed,
            poll_interval,
        })
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

        let hash = match self.api.add(link, &dir, listener.options().is_seed).await {
            Ok(hash) => hash,
            Err(e) => {
                if let Err(cleanup) = fsutil::remove_path(&dir).await {
                    tracing::warn!("Failed to remove {:?}: {}", dir, cleanup);
                }
                return Err(e);
            }
        };
        listener.set_torrent(true);

        let status = Arc::new(KedgeStatus {
            api: self.api.clone(),
            last: RwLock::new(KedgeTorrent {
                hash: hash.clone(),
                ..Default::default()
            }),
            hash: hash.clone(),
            index: listener.index(),
            listener: listener_ref,
            dir,
            seeding: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        });
        listener
            .context()
            .registry
            .add(listener.uid(), status.clone());
        listener.on_download_start(&hash).await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.poll(status, listener).await;
        });
        Ok(hash)
    }

    async fn poll(&self, status: Arc<KedgeStatus>, listener: Arc<MirrorListener>) {
        let seed_mode = listener.options().is_seed;
        let mut failures = 0;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            let seeding = status.is_seeding();

            if status.canceled.load(Ordering::SeqCst) {
                if seeding {
                    listener.on_seeding_complete(&status.summary()).await;
                } else {
                    listener.on_download_error(CANCELED_BY_USER).await;
                }
                return;
            }
            if !seeding && listener.is_canceled() {
                return;
            }

            let torrent = match self.api.status(&status.hash).await {
                Ok(torrent) => {
                    failures = 0;
                    torrent
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("kedge poll of {} failed ({}): {}", status.hash, failures, e);
                    if failures < MAX_POLL_FAILURES && !matches!(e, MirrorError::NotFound(_)) {
                        continue;
                    }
                    let reason = e.to_string();
                    if seeding {
                        listener.on_seeding_error(&reason).await;
                    } else {
                        listener.on_download_error(&reason).await;
                    }
                    return;
                }
            };
            status.observe(torrent.clone());

            match torrent.state {
                KedgeState::Error => {
                    let reason = torrent
                        .error
                        .unwrap_or_else(|| "kedge reported an error".to_string());
                    if seeding {
                        listener.on_seeding_error(&reason).await;
                    } else {
                        listener.on_download_error(&reason).await;
                    }
                    return;
                }
                KedgeState::Seeding | KedgeState::Finished if !seeding => {
                    if seed_mode && torrent.state == KedgeState::Seeding {
                        status.seeding.store(true, Ordering::SeqCst);
                        listener.on_seeding_start(status.clone());
                        let upload = listener.clone();
                        tokio::spawn(async move { upload.on_download_complete().await });
                        continue;
                    }
                    if let Err(e) = self.api.remove(&status.hash).await {
                        tracing::warn!("kedge remove {} failed: {}", status.hash, e);
                    }
                    listener.on_download_complete().await;
                    return;
                }
                KedgeState::Finished => {
                    // kedge stopped seeding on its own
                    listener.on_seeding_complete(&status.summary()).await;
                    return;
                }
                KedgeState::Seeding if self.seed_target_reached(&torrent) => {
                    if let Err(e) = self.api.remove(&status.hash).await {
                        tracing::warn!("kedge remove {} failed: {}", status.hash, e);
                    }
                    listener.on_seeding_complete(&status.summary()).await;
                    return;
                }
                _ => {}
            }
        }
    }

    fn seed_target_reached(&self, torrent: &KedgeTorrent) -> bool {
        let ratio_met = self.seed.ratio > 0.0 && torrent.ratio() >= self.seed.ratio;
        let time_met = self
            .seed
            .time
            .is_some_and(|limit| torrent.seeding_time() >= limit);
        ratio_met || time_met
    }
}

/// Status of a kedge torrent
///
/// Holds the last observation; once canceled, observations are frozen.
pub struct KedgeStatus {
    api: Arc<dyn KedgeApi>,
    hash: String,
    last: RwLock<KedgeTorrent>,
    index: u64,
    listener: ListenerRef,
    dir: PathBuf,
    seeding: AtomicBool,
    canceled: AtomicBool,
}

impl KedgeStatus {
    fn is_seeding(&self) -> bool {
        self.seeding.load(Ordering::SeqCst)
    }

    fn observe(&self, torrent: KedgeTorrent) {
        if self.canceled.load(Ordering::SeqCst) {
            return;
        }
        *self.last.write() = torrent;
    }

    fn summary(&self) -> String {
        let last = self.last.read();
        seed_summary(&last.name, last.ratio(), last.seeding_time())
    }

    /// Latest cached observation
    pub fn snapshot(&self) -> KedgeTorrent {
        self.last.read().clone()
    }
}

#[async_trait]
impl MirrorStatus for KedgeStatus {
    fn name(&self) -> String {
        let last = self.last.read();
        if last.name.is_empty() {
            self.hash.clone()
        } else {
            last.name.clone()
        }
    }

    fn completed_length(&self) -> i64 {
        let last = self.last.read();
        if self.is_seeding() {
            last.uploaded
        } else {
            last.completed_length
        }
    }

    fn total_length(&self) -> i64 {
        self.last.read().total_length
    }

    fn speed(&self) -> i64 {
        let last = self.last.read();
        if self.is_seeding() {
            last.upload_speed
        } else {
            last.download_speed
        }
    }

    fn eta(&self) -> Option<Duration> {
        let last = self.last.read();
        if self.is_seeding() {
            if last.uploaded > last.total_length {
                return Some(last.seeding_time());
            }
            return status::eta(last.uploaded, last.total_length, last.upload_speed);
        }
        status::eta(last.completed_length, last.total_length, last.download_speed)
    }

    fn gid(&self) -> String {
        self.hash.clone()
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
        if self.is_seeding() {
            return StatusType::Seeding;
        }
        match self.last.read().state {
            KedgeState::Queued | KedgeState::CheckingMetadata => StatusType::Waiting,
            _ => StatusType::Downloading,
        }
    }

    fn is_torrent(&self) -> bool {
        true
    }

    fn peers(&self) -> u32 {
        self.last.read().peers
    }

    fn seeders(&self) -> u32 {
        self.last.read().seeders
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        if self.is_seeding() {
            // Final numbers for the ratio summary before kedge forgets the torrent
            if let Ok(torrent) = self.api.status(&self.hash).await {
                *self.last.write() = torrent;
            }
        }
        self.canceled.store(true, Ordering::SeqCst);
        if let Err(e) = self.api.remove(&self.hash).await {
            tracing::warn!("kedge remove {} failed: {}", self.hash, e);
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
    fn test_parse_torrent() {
        let raw = json!({
            "hash": "c12fe1c06bba254a9dc9f519b335aa7c1367a88a",
            "name": "ubuntu.iso",
            "state": "checking_metadata",
            "total_length": 2048,
            "completed_length": 1024,
            "uploaded": 4096,
            "seeding_time": 90
        });
        let torrent: KedgeTorrent = serde_json::from_value(raw).unwrap();
        assert_eq!(torrent.state, KedgeState::CheckingMetadata);
        assert_eq!(torrent.ratio(), 2.0);
        assert_eq!(torrent.seeding_time(), Duration::from_secs(90));
        assert_eq!(torrent.peers, 0);
    }

    #[test]
    fn test_client_urls() {
        let client = KedgeClient::new("http://kedge:8080/");
        assert_eq!(client.url("/abc"), "http://kedge:8080/api/v1/torrents/abc");
    }
}
