//! Status capability shared by every transfer backend
//!
//! Each engine adapter produces a type implementing [`MirrorStatus`]. The
//! registry, renderer and command surface only ever see `Arc<dyn
//! MirrorStatus>`, so a uid can move from a download status to an archive
//! status to an upload status without anyone else noticing the swap.

use crate::listener::{CloneListener, MirrorListener};
use crate::protocol::{StatusType, Uid};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle to a live status object
pub type StatusRef = Arc<dyn MirrorStatus>;

/// Polling interface every backend status implements
#[async_trait]
pub trait MirrorStatus: Send + Sync {
    /// Display name of the file or folder
    fn name(&self) -> String;

    /// Bytes transferred so far
    fn completed_length(&self) -> i64;

    /// Total bytes (0 while unknown)
    fn total_length(&self) -> i64;

    /// Current rate in bytes/sec
    fn speed(&self) -> i64;

    /// Time left, or elapsed seed time once a seeding torrent overshoots its size
    fn eta(&self) -> Option<Duration> {
        eta(self.completed_length(), self.total_length(), self.speed())
    }

    /// Engine-assigned transfer id
    fn gid(&self) -> String;

    /// Filesystem location of the payload
    fn path(&self) -> PathBuf;

    /// Progress in `[0, 100]`
    fn percentage(&self) -> f64 {
        percentage(self.completed_length(), self.total_length())
    }

    fn status_type(&self) -> StatusType;

    fn is_torrent(&self) -> bool {
        false
    }

    fn peers(&self) -> u32 {
        0
    }

    fn seeders(&self) -> u32 {
        0
    }

    /// Display ordering key, preserved across stage replacement
    fn index(&self) -> u64;

    /// Ask the engine to abort. The listener still receives exactly one
    /// terminal callback afterwards.
    async fn cancel_mirror(&self) -> bool;

    /// Listener this status reports to
    fn listener(&self) -> Option<ListenerRef>;

    /// Drop engine handles once the status has left the active partition
    fn release(&self) {}
}

/// Back-reference from a status to the listener that owns its lifecycle
#[derive(Clone)]
pub enum ListenerRef {
    Mirror(Arc<MirrorListener>),
    Clone(Arc<CloneListener>),
}

impl ListenerRef {
    pub fn uid(&self) -> Uid {
        match self {
            Self::Mirror(l) => l.uid(),
            Self::Clone(l) => l.uid(),
        }
    }

    /// Telegram user id of whoever started the operation
    pub fn requester_id(&self) -> i64 {
        match self {
            Self::Mirror(l) => l.requester().user_id,
            Self::Clone(l) => l.requester().user_id,
        }
    }

    /// Route an error to whichever terminal callback the listener has
    pub async fn on_error(&self, reason: &str) {
        match self {
            Self::Mirror(l) => l.on_download_error(reason).await,
            Self::Clone(l) => l.on_clone_error(reason).await,
        }
    }
}

/// Percentage helper guarded against empty or unknown totals
pub fn percentage(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (completed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Remaining time at the current speed, `None` when it cannot be estimated
pub fn eta(completed: i64, total: i64, speed: i64) -> Option<Duration> {
    if speed <= 0 || total <= 0 {
        return None;
    }
    let remaining = (total - completed).max(0);
    Some(Duration::from_secs((remaining / speed) as u64))
}

/// Sliding-window speed meter
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, i64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record that `bytes` were transferred just now
    pub fn record(&mut self, bytes: i64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average bytes/sec across the window
    pub fn speed(&self) -> i64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        // The first sample's bytes were transferred before the window opened
        let bytes: i64 = self.samples.iter().skip(1).map(|(_, b)| *b).sum();
        (bytes as f64 / elapsed) as i64
    }
}

/// Progress cell shared between an in-process transfer task and its status
///
/// The task writes, the status (and so the renderer) reads.
#[derive(Debug)]
pub struct TransferProgress {
    name: RwLock<String>,
    completed: AtomicI64,
    total: AtomicI64,
    speed: AtomicI64,
    meter: Mutex<SpeedMeter>,
}

impl TransferProgress {
    pub fn new(name: impl Into<String>, total: i64) -> Self {
        Self {
            name: RwLock::new(name.into()),
            completed: AtomicI64::new(0),
            total: AtomicI64::new(total),
            speed: AtomicI64::new(0),
            meter: Mutex::new(SpeedMeter::new(Duration::from_secs(5))),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn completed(&self) -> i64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> i64 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Overwrite the completed counter (engines reporting absolute values)
    pub fn set_completed(&self, completed: i64) {
        let previous = self.completed.swap(completed, Ordering::Relaxed);
        let mut meter = self.meter.lock();
        meter.record((completed - previous).max(0));
        self.speed.store(meter.speed(), Ordering::Relaxed);
    }

    /// Add freshly transferred bytes
    pub fn add_completed(&self, bytes: i64) {
        self.completed.fetch_add(bytes, Ordering::Relaxed);
        let mut meter = self.meter.lock();
        meter.record(bytes);
        self.speed.store(meter.speed(), Ordering::Relaxed);
    }

    /// Overwrite the speed with an engine-reported value
    pub fn set_speed(&self, speed: i64) {
        self.speed.store(speed, Ordering::Relaxed);
    }
}

/// Frozen copy of a status kept in the canceled partition
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub name: String,
    pub completed_length: i64,
    pub total_length: i64,
    pub gid: String,
    pub path: PathBuf,
    pub status_type: StatusType,
    pub is_torrent: bool,
    pub peers: u32,
    pub seeders: u32,
    pub index: u64,
}

impl StatusSnapshot {
    /// Capture `status`, recording the stage it ended in
    pub fn capture(status: &dyn MirrorStatus, status_type: StatusType) -> Self {
        Self {
            name: status.name(),
            completed_length: status.completed_length(),
            total_length: status.total_length(),
            gid: status.gid(),
            path: status.path(),
            status_type,
            is_torrent: status.is_torrent(),
            peers: status.peers(),
            seeders: status.seeders(),
            index: status.index(),
        }
    }
}

#[async_trait]
impl MirrorStatus for StatusSnapshot {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn completed_length(&self) -> i64 {
        self.completed_length
    }

    fn total_length(&self) -> i64 {
        self.total_length
    }

    fn speed(&self) -> i64 {
        0
    }

    fn gid(&self) -> String {
        self.gid.clone()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn status_type(&self) -> StatusType {
        self.status_type
    }

    fn is_torrent(&self) -> bool {
        self.is_torrent
    }

    fn peers(&self) -> u32 {
        self.peers
    }

    fn seeders(&self) -> u32 {
        self.seeders
    }

    fn index(&self) -> u64 {
        self.index
    }

    async fn cancel_mirror(&self) -> bool {
        false
    }

    fn listener(&self) -> Option<ListenerRef> {
        None
    }
}
