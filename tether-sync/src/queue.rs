//! The pending change queue.
//!
//! A durable log of not-yet-acknowledged local mutations. The application
//! layer appends; the sync manager's acknowledge/failure paths are the only
//! removal routes. One mutex guards the whole queue - correctness matters
//! far more than throughput here.

use std::collections::VecDeque;
use tether_core::{DataType, ItemId, PendingChange, SyncItem, Timestamp};
use tokio::sync::Mutex;

/// Mutex-guarded FIFO of pending changes plus a side list of items that
/// exhausted their push attempts.
#[derive(Debug)]
pub struct PendingQueue {
    max_attempts: u32,
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<PendingChange>,
    failed: Vec<PendingChange>,
}

impl PendingQueue {
    /// `max_attempts` is the push-attempt ceiling after which an item is
    /// surfaced as permanently failed instead of retried forever.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Append a local mutation. A change already queued for the same
    /// `(id, data_type)` is superseded in place: the newer mutation replaces
    /// its payload and the attempt count restarts, while the original
    /// `queued_at` is kept.
    pub async fn enqueue(&self, item: SyncItem, now: Timestamp) {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .pending
            .iter_mut()
            .find(|change| change.item.record_key() == item.record_key())
        {
            existing.item = item;
            existing.attempt_count = 0;
            return;
        }
        inner.pending.push_back(PendingChange::new(item, now));
    }

    /// The next batch to push, front of the queue first. Non-destructive:
    /// items leave the queue only through [`acknowledge`](Self::acknowledge)
    /// or the failure ceiling.
    pub async fn next_batch(&self, limit: usize) -> Vec<PendingChange> {
        let inner = self.inner.lock().await;
        inner.pending.iter().take(limit).cloned().collect()
    }

    /// Remove changes the remote acknowledged. Returns the removed changes
    /// so the caller can mark the corresponding records clean.
    pub async fn acknowledge(&self, ids: &[ItemId]) -> Vec<PendingChange> {
        let mut inner = self.inner.lock().await;
        let mut acked = Vec::new();
        let mut remaining = VecDeque::with_capacity(inner.pending.len());
        for change in inner.pending.drain(..) {
            if ids.contains(&change.item.id) {
                acked.push(change);
            } else {
                remaining.push_back(change);
            }
        }
        inner.pending = remaining;
        acked
    }

    /// Remove a single change, regardless of attempt count. Used when a
    /// conflict resolution supersedes the queued version.
    pub async fn remove(&self, id: ItemId, data_type: DataType) -> Option<PendingChange> {
        let mut inner = self.inner.lock().await;
        let position = inner
            .pending
            .iter()
            .position(|change| change.item.record_key() == (id, data_type))?;
        inner.pending.remove(position)
    }

    /// Record a failed push attempt for each id. Items that reach the
    /// attempt ceiling move to the failed side list; the newly failed
    /// changes are returned so the caller can surface them.
    pub async fn record_failure(&self, ids: &[ItemId]) -> Vec<PendingChange> {
        let mut inner = self.inner.lock().await;
        let mut newly_failed = Vec::new();
        let mut remaining = VecDeque::with_capacity(inner.pending.len());
        for mut change in inner.pending.drain(..) {
            if ids.contains(&change.item.id) {
                change.attempt_count += 1;
                if change.attempt_count >= self.max_attempts {
                    newly_failed.push(change);
                    continue;
                }
            }
            remaining.push_back(change);
        }
        inner.pending = remaining;
        inner.failed.extend(newly_failed.iter().cloned());
        newly_failed
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    /// Changes that exhausted their attempts, kept visible until cleared.
    pub async fn failed_items(&self) -> Vec<PendingChange> {
        self.inner.lock().await.failed.clone()
    }

    /// Operator action: drop the failed side list after review.
    pub async fn clear_failed(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.failed.len();
        inner.failed.clear();
        count
    }
}

// ============================================================================
// TESTS
// ============================================================================
