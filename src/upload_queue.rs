//! Upload admission
//!
//! Caps the number of simultaneous cloud uploads. Listeners acquire an
//! [`UploadPermit`] before uploading; excess uploads wait in FIFO order
//! until a permit is dropped. Downloads are never gated here.

use crate::error::{MirrorError, Result};
use crate::protocol::Uid;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A permit that allows an upload to proceed
/// When dropped, releases the slot back to the queue
pub struct UploadPermit {
    _permit: OwnedSemaphorePermit,
    uid: Uid,
    queue: Arc<UploadQueue>,
}

impl UploadPermit {
    pub fn uid(&self) -> Uid {
        self.uid
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        self.queue.inner.lock().active.remove(&self.uid);
    }
}

/// Removes a waiter from the queue bookkeeping even if `acquire` is dropped
struct WaitingGuard<'a> {
    queue: &'a UploadQueue,
    uid: Uid,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock();
        if let Some(pos) = inner.waiting.iter().position(|u| *u == self.uid) {
            inner.waiting.remove(pos);
        }
    }
}

#[derive(Default)]
struct UploadQueueInner {
    /// Uploads waiting for a slot, oldest first
    waiting: VecDeque<Uid>,
    /// Uploads currently holding a permit
    active: HashSet<Uid>,
}

/// Bounded FIFO admission for cloud uploads
pub struct UploadQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    inner: Mutex<UploadQueueInner>,
}

impl UploadQueue {
    /// Create a queue admitting at most `capacity` uploads at once
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            inner: Mutex::new(UploadQueueInner::default()),
        })
    }

    /// Wait for an upload slot.
    ///
    /// Waiters are served in arrival order. Fails with
    /// [`MirrorError::Shutdown`] once the queue is closed.
    pub async fn acquire(self: &Arc<Self>, uid: Uid) -> Result<UploadPermit> {
        self.inner.lock().waiting.push_back(uid);
        let _waiting = WaitingGuard { queue: self, uid };

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MirrorError::Shutdown)?;

        self.inner.lock().active.insert(uid);
        Ok(UploadPermit {
            _permit: permit,
            uid,
            queue: Arc::clone(self),
        })
    }

    /// Take a slot only if one is free and nobody is queued ahead
    pub fn try_acquire(self: &Arc<Self>, uid: Uid) -> Option<UploadPermit> {
        let mut inner = self.inner.lock();
        if !inner.waiting.is_empty() {
            return None;
        }
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        inner.active.insert(uid);
        Some(UploadPermit {
            _permit: permit,
            uid,
            queue: Arc::clone(self),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Uploads currently running
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Uploads waiting for a slot
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_waiting(&self, uid: Uid) -> bool {
        self.inner.lock().waiting.contains(&uid)
    }

    /// Fail every pending and future `acquire`
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn uid(n: i32) -> Uid {
        Uid::new(1, n)
    }

    #[tokio::test]
    async fn test_basic_acquire() {
        let queue = UploadQueue::new(2);

        let p1 = queue.acquire(uid(1)).await.unwrap();
        let p2 = queue.acquire(uid(2)).await.unwrap();
        assert_eq!(queue.active_count(), 2);
        assert!(queue.try_acquire(uid(3)).is_none());

        drop(p1);
        assert_eq!(queue.active_count(), 1);
        drop(p2);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_fifo() {
        let queue = UploadQueue::new(1);
        let first = queue.acquire(uid(1)).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for n in 2..=4 {
            let queue = queue.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = queue.acquire(uid(n)).await.unwrap();
                tx.send(n).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(permit);
            });
            // Let each waiter enqueue before spawning the next
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(queue.waiting_count(), 3);
        assert!(queue.is_waiting(uid(2)));
        drop(first);

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let queue = UploadQueue::new(1);
        let _held = queue.acquire(uid(1)).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire(uid(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MirrorError::Shutdown)));
        assert_eq!(queue.waiting_count(), 0);
    }
}
