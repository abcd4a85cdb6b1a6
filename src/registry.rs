//! Mirror registry
//!
//! In-memory map of every transfer the bot knows about, split into three
//! partitions keyed by [`Uid`]:
//!
//! - *active*: in-flight transfers, one live status per uid
//! - *canceled*: frozen snapshots of mirrors that ended in error or cancel
//! - *seeding*: torrents that keep seeding after their download finished
//!
//! A single coarse lock guards all partitions. Snapshots are collected under
//! the lock and sorted outside it; no lock is ever held across an await.

use crate::protocol::{StatusType, Uid};
use crate::status::{StatusRef, StatusSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Partitions {
    active: HashMap<Uid, StatusRef>,
    canceled: HashMap<Uid, StatusSnapshot>,
    seeding: HashMap<Uid, StatusRef>,
}

/// Process-wide registry of mirrors
#[derive(Default)]
pub struct MirrorRegistry {
    inner: RwLock<Partitions>,
    next_index: AtomicU64,
}

impl MirrorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next display index; strictly increasing for the life of the process
    pub fn generate_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert or replace the active status for `uid`
    pub fn add(&self, uid: Uid, status: StatusRef) {
        self.inner.write().active.insert(uid, status);
    }

    /// Remove the active status for `uid`, if any
    pub fn remove(&self, uid: Uid) -> Option<StatusRef> {
        self.inner.write().active.remove(&uid)
    }

    pub fn get_by_uid(&self, uid: Uid) -> Option<StatusRef> {
        self.inner.read().active.get(&uid).cloned()
    }

    pub fn get_by_gid(&self, gid: &str) -> Option<StatusRef> {
        self.inner
            .read()
            .active
            .values()
            .find(|s| s.gid() == gid)
            .cloned()
    }

    pub fn get_seeding(&self, uid: Uid) -> Option<StatusRef> {
        self.inner.read().seeding.get(&uid).cloned()
    }

    pub fn get_seeding_by_gid(&self, gid: &str) -> Option<StatusRef> {
        self.inner
            .read()
            .seeding
            .values()
            .find(|s| s.gid() == gid)
            .cloned()
    }

    pub fn get_canceled(&self, uid: Uid) -> Option<StatusSnapshot> {
        self.inner.read().canceled.get(&uid).cloned()
    }

    /// Active statuses ordered by index
    pub fn all_sorted(&self) -> Vec<StatusRef> {
        let mut all: Vec<StatusRef> = self.inner.read().active.values().cloned().collect();
        all.sort_by_key(|s| s.index());
        all
    }

    /// [`all_sorted`](Self::all_sorted) split into pages of `page_size`
    pub fn chunked(&self, page_size: usize) -> Vec<Vec<StatusRef>> {
        paginate(self.all_sorted(), page_size)
    }

    /// Active and seeding statuses ordered by index
    ///
    /// A uid present in both partitions (a seed mirror still uploading) is
    /// shown once, with its active stage.
    pub fn display_sorted(&self) -> Vec<StatusRef> {
        let mut all: Vec<StatusRef> = {
            let inner = self.inner.read();
            inner
                .active
                .values()
                .cloned()
                .chain(
                    inner
                        .seeding
                        .iter()
                        .filter(|(uid, _)| !inner.active.contains_key(uid))
                        .map(|(_, s)| s.clone()),
                )
                .collect()
        };
        all.sort_by_key(|s| s.index());
        all
    }

    /// [`display_sorted`](Self::display_sorted) split into pages
    pub fn display_pages(&self, page_size: usize) -> Vec<Vec<StatusRef>> {
        paginate(self.display_sorted(), page_size)
    }

    /// Record a terminal status and drop the active entry in one step
    ///
    /// Engine handles held by `status` are released; only a frozen copy is
    /// retained.
    pub fn move_to_canceled(&self, uid: Uid, status: &StatusRef) {
        let snapshot = StatusSnapshot::capture(status.as_ref(), StatusType::Canceled);
        {
            let mut inner = self.inner.write();
            inner.canceled.insert(uid, snapshot);
            inner.active.remove(&uid);
        }
        status.release();
    }

    /// Copy `status` into the seeding partition; the active entry is kept
    pub fn move_to_seeding(&self, uid: Uid, status: StatusRef) {
        self.inner.write().seeding.insert(uid, status);
    }

    pub fn remove_from_seeding(&self, uid: Uid) -> Option<StatusRef> {
        self.inner.write().seeding.remove(&uid)
    }

    /// Number of active transfers
    pub fn count(&self) -> usize {
        self.inner.read().active.len()
    }

    /// Number of seeding transfers
    pub fn count_seeding(&self) -> usize {
        self.inner.read().seeding.len()
    }

    /// Active plus seeding, read under one lock
    pub fn count_live(&self) -> usize {
        let inner = self.inner.read();
        inner.active.len() + inner.seeding.len()
    }

    /// Drop every entry; used on shutdown
    pub fn clear(&self) {
        let drained: Vec<StatusRef> = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            inner.canceled.clear();
            inner
                .active
                .drain()
                .chain(inner.seeding.drain())
                .map(|(_, s)| s)
                .collect()
        };
        for status in drained {
            status.release();
        }
    }
}

fn paginate(all: Vec<StatusRef>, page_size: usize) -> Vec<Vec<StatusRef>> {
    if all.is_empty() {
        return vec![Vec::new()];
    }
    all.chunks(page_size.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn status(gid: &str, index: u64, status_type: StatusType) -> StatusRef {
        Arc::new(StatusSnapshot {
            name: format!("{}.bin", gid),
            completed_length: 10,
            total_length: 100,
            gid: gid.to_string(),
            path: PathBuf::from("/tmp").join(gid),
            status_type,
            is_torrent: false,
            peers: 0,
            seeders: 0,
            index,
        })
    }

    fn gids(statuses: &[StatusRef]) -> Vec<String> {
        statuses.iter().map(|s| s.gid()).collect()
    }

    #[test]
    fn test_index_is_monotonic() {
        let registry = MirrorRegistry::new();
        let first = registry.generate_index();
        let second = registry.generate_index();
        let third = registry.generate_index();
        assert!(first < second && second < third);
    }

    #[test]
    fn test_add_replaces_stage() {
        let registry = MirrorRegistry::new();
        let uid = Uid::new(1, 10);
        registry.add(uid, status("a", 0, StatusType::Downloading));
        registry.add(uid, status("a", 0, StatusType::Uploading));

        assert_eq!(registry.count(), 1);
        let current = registry.get_by_uid(uid).expect("status missing");
        assert_eq!(current.status_type(), StatusType::Uploading);
        assert!(registry.get_by_gid("a").is_some());
        assert!(registry.get_by_gid("b").is_none());
    }

    #[test]
    fn test_move_to_canceled() {
        let registry = MirrorRegistry::new();
        let uid = Uid::new(1, 11);
        let live = status("gone", 4, StatusType::Downloading);
        registry.add(uid, live.clone());

        registry.move_to_canceled(uid, &live);

        assert_eq!(registry.count(), 0);
        assert!(registry.get_by_uid(uid).is_none());
        let frozen = registry.get_canceled(uid).expect("snapshot missing");
        assert_eq!(frozen.status_type, StatusType::Canceled);
        assert_eq!(frozen.gid, "gone");
        assert_eq!(frozen.index, 4);
        assert_eq!(frozen.completed_length, 10);
    }

    #[test]
    fn test_sorted_by_index() {
        let registry = MirrorRegistry::new();
        registry.add(Uid::new(1, 1), status("c", 7, StatusType::Downloading));
        registry.add(Uid::new(1, 2), status("a", 2, StatusType::Downloading));
        registry.add(Uid::new(1, 3), status("b", 5, StatusType::Uploading));

        assert_eq!(gids(&registry.all_sorted()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_seeding_shown_once() {
        let registry = MirrorRegistry::new();
        let uploading = Uid::new(1, 1);
        let seeding_only = Uid::new(1, 2);
        let seed = status("s1", 3, StatusType::Seeding);

        registry.add(uploading, status("s1", 3, StatusType::Uploading));
        registry.move_to_seeding(uploading, seed.clone());
        registry.move_to_seeding(seeding_only, status("s2", 1, StatusType::Seeding));

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.count_seeding(), 2);
        assert_eq!(registry.count_live(), 3);

        let shown = registry.display_sorted();
        assert_eq!(gids(&shown), vec!["s2", "s1"]);
        assert_eq!(shown[1].status_type(), StatusType::Uploading);

        registry.remove(uploading);
        let shown = registry.display_sorted();
        assert_eq!(shown[1].status_type(), StatusType::Seeding);
        assert!(registry.get_seeding_by_gid("s1").is_some());

        assert!(registry.remove_from_seeding(uploading).is_some());
        assert!(registry.get_seeding(uploading).is_none());
        assert_eq!(registry.count_live(), 1);
    }

    #[test]
    fn test_pagination() {
        let registry = MirrorRegistry::new();
        assert_eq!(registry.chunked(10).len(), 1);
        assert!(registry.chunked(10)[0].is_empty());

        for i in 0..25 {
            let gid = format!("g{}", i);
            registry.add(Uid::new(1, i), status(&gid, i as u64, StatusType::Downloading));
        }
        let pages = registry.chunked(10);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].len(), 5);
        assert_eq!(pages[1][0].gid(), "g10");
        assert_eq!(registry.display_pages(0).len(), 25);
    }

    #[test]
    fn test_clear() {
        let registry = MirrorRegistry::new();
        let uid = Uid::new(1, 1);
        let live = status("x", 0, StatusType::Downloading);
        registry.add(uid, live.clone());
        registry.move_to_seeding(Uid::new(1, 2), status("y", 1, StatusType::Seeding));
        registry.move_to_canceled(Uid::new(1, 3), &status("z", 2, StatusType::Downloading));

        registry.clear();

        assert_eq!(registry.count_live(), 0);
        assert!(registry.get_canceled(Uid::new(1, 3)).is_none());
    }
}
