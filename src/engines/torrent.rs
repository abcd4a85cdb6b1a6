//! Local BitTorrent engine adapter
//!
//! The engine itself sits behind [`TorrentEngine`] / [`TorrentHandle`].
//! Completion comes from the handle's phase channel; every status read
//! pulls live numbers from the handle. Seed-mode mirrors keep the handle
//! running after download and stop it once the ratio or time target is met.

use crate::config::SeedConfig;
use crate::engines::seed_summary;
use crate::error::{MirrorError, Result, CANCELED_BY_USER};
use crate::fsutil;
use crate::listener::MirrorListener;
use crate::protocol::StatusType;
use crate::status::{self, ListenerRef, MirrorStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

/// Live counters of a torrent
#[derive(Debug, Clone, Default)]
pub struct TorrentStats {
    pub name: String,
    pub total_length: i64,
    pub completed_length: i64,
    pub download_speed: i64,
    pub upload_speed: i64,
    /// Bytes uploaded to peers
    pub uploaded: i64,
    pub peers: u32,
    pub seeders: u32,
    /// Time spent seeding so far
    pub seeding_time: Duration,
}

impl TorrentStats {
    pub fn ratio(&self) -> f64 {
        if self.total_length <= 0 {
            return 0.0;
        }
        self.uploaded as f64 / self.total_length as f64
    }
}

/// Lifecycle phase reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentPhase {
    FetchingMetadata,
    Downloading,
    /// All pieces verified
    Finished,
    Stopped,
    Error,
}

/// What to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    Magnet(String),
    /// URL of a `.torrent` file
    Url(String),
    /// Raw `.torrent` bytes
    File(Vec<u8>),
}

impl TorrentSource {
    pub fn from_link(link: &str) -> Result<Self> {
        if link.starts_with("magnet:") {
            return Ok(Self::Magnet(link.to_string()));
        }
        let url = Url::parse(link)?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Url(link.to_string())),
            other => Err(MirrorError::invalid_input(
                "url",
                format!("Unsupported torrent scheme: {}", other),
            )),
        }
    }

    /// Info hash when it can be read without the engine (magnets only)
    pub fn info_hash(&self) -> Option<String> {
        match self {
            Self::Magnet(link) => magnet_info_hash(link),
            _ => None,
        }
    }
}

/// Extract the lower-cased `btih` hash from a magnet link
pub fn magnet_info_hash(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    url.query_pairs()
        .filter(|(k, _)| k == "xt")
        .find_map(|(_, v)| v.strip_prefix("urn:btih:").map(|h| h.to_ascii_lowercase()))
        .filter(|h| h.len() == 40 || h.len() == 32)
}

/// Handle to one torrent inside the engine
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    fn info_hash(&self) -> String;

    /// Current counters, read live
    fn stats(&self) -> TorrentStats;

    /// Phase notifications; the receiver starts at the current phase
    fn phases(&self) -> watch::Receiver<TorrentPhase>;

    /// Engine error message once the phase is `Error`
    fn error(&self) -> Option<String>;

    /// Stop the torrent and drop it from the engine, keeping files
    async fn stop(&self) -> Result<()>;
}

/// Local BitTorrent engine
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Start a torrent into `dir`; a torrent already in the engine fails
    /// with [`MirrorError::AlreadyExists`]
    async fn add(&self, source: TorrentSource, dir: &Path) -> Result<Arc<dyn TorrentHandle>>;
}

/// Adapter driving mirrors through a [`TorrentEngine`]
pub struct TorrentDownloader {
    engine: Arc<dyn TorrentEngine>,
    seed: SeedConfig,
    active: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl TorrentDownloader {
    pub fn new(engine: Arc<dyn TorrentEngine>, seed: SeedConfig) -> Arc<Self> {
        Self::with_poll_interval(engine, seed, Duration::from_secs(1))
    }

    pub fn with_poll_interval(
        engine: Arc<dyn TorrentEngine>,
        seed: SeedConfig,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            seed,
            active: Mutex::new(HashSet::new()),
            poll_interval,
        })
    }

    /// Info hashes currently handled by this adapter
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Add a magnet or `.torrent` link for `listener`
    ///
    /// A duplicate of a running torrent is rejected, nothing is registered
    /// and the mirror's directory is removed.
    pub async fn add_download(
        self: &Arc<Self>,
        link: &str,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let source = TorrentSource::from_link(link)?;
        self.add_source(source, listener).await
    }

    pub async fn add_source(
        self: &Arc<Self>,
        source: TorrentSource,
        listener: Arc<MirrorListener>,
    ) -> Result<String> {
        let listener_ref = listener
            .listener_ref()
            .ok_or_else(|| MirrorError::Internal("listener dropped".to_string()))?;
        let dir = listener.dir();

        if let Some(hash) = source.info_hash() {
            if self.active.lock().contains(&hash) {
                if let Err(e) = fsutil::remove_path(&dir).await {
                    tracing::warn!("Failed to remove {:?}: {}", dir, e);
                }
                return Err(MirrorError::AlreadyExists(format!("torrent {}", hash)));
            }
        }

        tokio::fs::create_dir_all(&dir).await?;
        let handle = match self.engine.add(source, &dir).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(cleanup) = fsutil::remove_path(&dir).await {
                    tracing::warn!("Failed to remove {:?}: {}", dir, cleanup);
                }
                return Err(e);
            }
        };
        let hash = handle.info_hash();
        if !self.active.lock().insert(hash.clone()) {
            if let Err(e) = handle.stop().await {
                tracing::warn!("Failed to stop duplicate torrent {}: {}", hash, e);
            }
            if let Err(e) = fsutil::remove_path(&dir).await {
                tracing::warn!("Failed to remove {:?}: {}", dir, e);
            }
            return Err(MirrorError::AlreadyExists(format!("torrent {}", hash)));
        }

        listener.set_torrent(true);
        let status = Arc::new(TorrentStatus {
            handle: handle.clone(),
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

        let this = self.clone();
        tokio::spawn(async move {
            this.watch(status, listener).await;
            this.active.lock().remove(&hash);
        });
        Ok(handle.info_hash())
    }

    async fn watch(&self, status: Arc<TorrentStatus>, listener: Arc<MirrorListener>) {
        let seed_mode = listener.options().is_seed;
        let mut phases = status.handle.phases();

        loop {
            let phase = *phases.borrow_and_update();
            let seeding = status.seeding.load(Ordering::SeqCst);

            if status.canceled.load(Ordering::SeqCst) {
                if seeding {
                    listener.on_seeding_complete(&self.summary(&status)).await;
                } else {
                    listener.on_download_error(CANCELED_BY_USER).await;
                }
                return;
            }

            match phase {
                TorrentPhase::Error => {
                    let reason = status
                        .handle
                        .error()
                        .unwrap_or_else(|| "torrent engine error".to_string());
                    if seeding {
                        listener.on_seeding_error(&reason).await;
                    } else {
                        listener.on_download_error(&reason).await;
                    }
                    return;
                }
                TorrentPhase::Stopped => {
                    if seeding {
                        listener.on_seeding_complete(&self.summary(&status)).await;
                    } else {
                        listener.on_download_error("Torrent was stopped").await;
                    }
                    return;
                }
                TorrentPhase::Finished if !seeding => {
                    if seed_mode {
                        status.seeding.store(true, Ordering::SeqCst);
                        listener.on_seeding_start(status.clone());
                        let upload = listener.clone();
                        tokio::spawn(async move { upload.on_download_complete().await });
                    } else {
                        if let Err(e) = status.handle.stop().await {
                            tracing::warn!("Failed to stop finished torrent: {}", e);
                        }
                        listener.on_download_complete().await;
                        return;
                    }
                }
                _ => {}
            }

            if status.seeding.load(Ordering::SeqCst) && self.seed_target_reached(&status) {
                if let Err(e) = status.handle.stop().await {
                    tracing::warn!("Failed to stop seeding torrent: {}", e);
                }
                listener.on_seeding_complete(&self.summary(&status)).await;
                return;
            }

            tokio::select! {
                changed = phases.changed() => {
                    if changed.is_err() {
                        // Engine dropped the torrent without a final phase
                        if status.seeding.load(Ordering::SeqCst) {
                            listener.on_seeding_error("Torrent engine closed").await;
                        } else {
                            listener.on_download_error("Torrent engine closed").await;
                        }
                        return;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn seed_target_reached(&self, status: &TorrentStatus) -> bool {
        let stats = status.handle.stats();
        let ratio_met = self.seed.ratio > 0.0 && stats.ratio() >= self.seed.ratio;
        let time_met = self
            .seed
            .time
            .is_some_and(|limit| stats.seeding_time >= limit);
        ratio_met || time_met
    }

    fn summary(&self, status: &TorrentStatus) -> String {
        let stats = status.handle.stats();
        seed_summary(&stats.name, stats.ratio(), stats.seeding_time)
    }
}

/// Status of a local torrent; numbers are read from the engine on every call
pub struct TorrentStatus {
    handle: Arc<dyn TorrentHandle>,
    index: u64,
    listener: ListenerRef,
    dir: PathBuf,
    seeding: AtomicBool,
    canceled: AtomicBool,
}

impl TorrentStatus {
    fn is_seeding(&self) -> bool {
        self.seeding.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MirrorStatus for TorrentStatus {
    fn name(&self) -> String {
        let name = self.handle.stats().name;
        if name.is_empty() {
            self.handle.info_hash()
        } else {
            name
        }
    }

    fn completed_length(&self) -> i64 {
        let stats = self.handle.stats();
        if self.is_seeding() {
            stats.uploaded
        } else {
            stats.completed_length
        }
    }

    fn total_length(&self) -> i64 {
        self.handle.stats().total_length
    }

    fn speed(&self) -> i64 {
        let stats = self.handle.stats();
        if self.is_seeding() {
            stats.upload_speed
        } else {
            stats.download_speed
        }
    }

    fn eta(&self) -> Option<Duration> {
        let stats = self.handle.stats();
        if self.is_seeding() {
            if stats.uploaded > stats.total_length {
                return Some(stats.seeding_time);
            }
            return status::eta(stats.uploaded, stats.total_length, stats.upload_speed);
        }
        status::eta(
            stats.completed_length,
            stats.total_length,
            stats.download_speed,
        )
    }

    fn gid(&self) -> String {
        self.handle.info_hash()
    }

    fn path(&self) -> PathBuf {
        let name = self.handle.stats().name;
        if name.is_empty() {
            self.dir.clone()
        } else {
            self.dir.join(name)
        }
    }

    fn status_type(&self) -> StatusType {
        if self.is_seeding() {
            return StatusType::Seeding;
        }
        match *self.handle.phases().borrow() {
            TorrentPhase::FetchingMetadata => StatusType::Waiting,
            _ => StatusType::Downloading,
        }
    }

    fn is_torrent(&self) -> bool {
        true
    }

    fn peers(&self) -> u32 {
        self.handle.stats().peers
    }

    fn seeders(&self) -> u32 {
        self.handle.stats().seeders
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        if let Err(e) = self.handle.stop().await {
            tracing::warn!("Failed to stop torrent {}: {}", self.handle.info_hash(), e);
        }
        true
    }

    fn listener(&self) -> Option<ListenerRef> {
        Some(self.listener.clone())
    }
}
