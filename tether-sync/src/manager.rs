//! The sync manager state machine.
//!
//! Orchestrates batch cycles: push the pending queue, pull per-type deltas,
//! resolve conflicts, then advance the checkpoint - in that order. Push
//! precedes pull so the device's own pending changes do not come back as
//! phantom "remote" changes. The checkpoint advances only after a fully
//! successful cycle; a partial failure leaves it untouched and the next
//! cycle re-derives the same idempotent delta.

use crate::queue::PendingQueue;
use crate::resolver::{ConflictResolver, Resolution};
use crate::store::ItemStore;
use crate::transport::SyncTransport;
use crate::wire::{PullRequest, PushRequest};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tether_core::{
    ConflictInfo, DataType, ItemId, ResolutionStrategy, SyncConfig, SyncError, SyncItem, Timestamp,
};
use tether_realtime::{ChannelEvent, ChannelStatus, RealtimeChannel};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// STATES AND SUMMARIES
// ============================================================================

/// Where the manager currently stands. `Offline` is reachable from any
/// state on connectivity loss; `Idle` is re-entered once a cycle succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pushing,
    Pulling,
    ResolvingConflicts,
    Offline,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleStatus {
    Completed,
    /// Connectivity failed after retries; queued changes stay visible as
    /// pending and the next cycle re-derives the same delta.
    Offline { reason: String },
    /// Fatal local corruption; sync stays suspended until the operator
    /// clears it.
    Suspended { reason: String },
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub status: CycleStatus,
    /// Items the remote acknowledged this cycle.
    pub pushed: usize,
    /// Remote items applied to the local replica.
    pub applied: usize,
    pub conflicts_resolved: usize,
    pub conflicts_manual: usize,
    /// Items that exhausted their attempt budget this cycle.
    pub newly_failed: Vec<ItemId>,
    /// The checkpoint after this cycle, if one has ever been recorded.
    pub checkpoint: Option<Timestamp>,
}

impl CycleSummary {
    fn empty() -> Self {
        Self {
            status: CycleStatus::Completed,
            pushed: 0,
            applied: 0,
            conflicts_resolved: 0,
            conflicts_manual: 0,
            newly_failed: Vec::new(),
            checkpoint: None,
        }
    }
}

/// A dirty local version paired with the newer server version.
type ConflictPair = (SyncItem, SyncItem);

// ============================================================================
// MANAGER
// ============================================================================

/// Orchestrates sync cycles for one device. At most one cycle is in flight;
/// a concurrent [`sync_now`](Self::sync_now) joins the running cycle rather
/// than starting a second one.
pub struct SyncManager {
    config: SyncConfig,
    queue: Arc<PendingQueue>,
    store: Arc<dyn ItemStore>,
    transport: Arc<dyn SyncTransport>,
    resolver: ConflictResolver,
    realtime: Option<Arc<RealtimeChannel>>,

    state: RwLock<SyncState>,
    last_sync: RwLock<Option<Timestamp>>,
    manual_conflicts: Mutex<Vec<ConflictInfo>>,
    suspension: Mutex<Option<String>>,

    cycle_lock: tokio::sync::Mutex<()>,
    outcome_tx: watch::Sender<Option<CycleSummary>>,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        queue: Arc<PendingQueue>,
        store: Arc<dyn ItemStore>,
        transport: Arc<dyn SyncTransport>,
        resolver: ConflictResolver,
    ) -> Self {
        let (outcome_tx, _outcome_rx) = watch::channel(None);
        Self {
            config,
            queue,
            store,
            transport,
            resolver,
            realtime: None,
            state: RwLock::new(SyncState::Idle),
            last_sync: RwLock::new(None),
            manual_conflicts: Mutex::new(Vec::new()),
            suspension: Mutex::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
            outcome_tx,
        }
    }

    /// Attach the realtime channel for sub-interval propagation.
    pub fn with_realtime(mut self, channel: Arc<RealtimeChannel>) -> Self {
        self.realtime = Some(channel);
        self
    }

    pub fn state(&self) -> SyncState {
        *self.read_lock(&self.state)
    }

    pub fn is_offline(&self) -> bool {
        self.state() == SyncState::Offline
    }

    /// The last server timestamp through which a pull has been fully and
    /// successfully applied.
    pub fn checkpoint(&self) -> Option<Timestamp> {
        *self.read_lock(&self.last_sync)
    }

    /// Conflicts awaiting a user decision. Listed until resolved, never
    /// silently dropped.
    pub fn manual_conflicts(&self) -> Vec<ConflictInfo> {
        self.mutex_lock(&self.manual_conflicts).clone()
    }

    /// Why sync is suspended, if it is.
    pub fn suspension_reason(&self) -> Option<String> {
        self.mutex_lock(&self.suspension).clone()
    }

    /// Operator action after repairing the local state.
    pub fn clear_suspension(&self) {
        *self.mutex_lock(&self.suspension) = None;
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Record a local mutation: store it dirty, queue it for push, and - when
    /// the realtime channel is up - attempt immediate delivery. A failed
    /// immediate delivery is not an error; the item simply waits for the
    /// next batch cycle.
    pub async fn enqueue_local(&self, item: SyncItem) -> Result<(), SyncError> {
        self.store.apply_local(&item).await?;
        self.queue.enqueue(item.clone(), Utc::now()).await;

        if self.config.realtime_enabled {
            if let Some(channel) = &self.realtime {
                if channel.status() == ChannelStatus::Connected {
                    match channel.send_item(item.clone()).await {
                        Ok(true) => {
                            let acked = self.queue.acknowledge(&[item.id]).await;
                            for change in &acked {
                                self.store
                                    .mark_clean(change.item.id, change.item.data_type)
                                    .await?;
                            }
                            tracing::debug!(item_id = %item.id, "Delivered via realtime channel");
                        }
                        Ok(false) => {
                            tracing::debug!(
                                item_id = %item.id,
                                "Realtime delivery refused; batch push will surface the rejection"
                            );
                        }
                        Err(err) => {
                            tracing::debug!(
                                item_id = %item.id,
                                error = %err,
                                "Not delivered via realtime; falling back to batch sync"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pending changes not yet acknowledged, for display.
    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    // ------------------------------------------------------------------
    // Cycle entry
    // ------------------------------------------------------------------

    /// Run a sync cycle now, or join the one already in flight.
    pub async fn sync_now(&self) -> CycleSummary {
        let mut outcome_rx = self.outcome_tx.subscribe();
        match self.cycle_lock.try_lock() {
            Ok(_guard) => {
                let summary = self.run_cycle().await;
                let _ = self.outcome_tx.send(Some(summary.clone()));
                summary
            }
            Err(_) => {
                // A cycle is in flight; await its outcome instead of
                // starting a second one.
                if outcome_rx.changed().await.is_ok() {
                    if let Some(summary) = outcome_rx.borrow().clone() {
                        return summary;
                    }
                }
                CycleSummary::empty()
            }
        }
    }

    async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::empty();
        summary.checkpoint = self.checkpoint();

        if let Some(reason) = self.suspension_reason() {
            summary.status = CycleStatus::Suspended { reason };
            return summary;
        }

        let mut conflicts: Vec<ConflictPair> = Vec::new();

        self.set_state(SyncState::Pushing);
        if let Err(err) = self.push_phase(&mut summary, &mut conflicts).await {
            return self.fail_cycle(err, summary);
        }

        self.set_state(SyncState::Pulling);
        let candidate = match self.pull_phase(&mut summary, &mut conflicts).await {
            Ok(candidate) => candidate,
            Err(err) => return self.fail_cycle(err, summary),
        };

        self.set_state(SyncState::ResolvingConflicts);
        if let Err(err) = self.resolve_phase(conflicts, &mut summary).await {
            return self.fail_cycle(err, summary);
        }

        // Checkpoint: only a fully successful cycle advances it, and only
        // forward.
        if let Some(candidate) = candidate {
            let mut guard = self.write_lock(&self.last_sync);
            if guard.map(|current| candidate > current).unwrap_or(true) {
                *guard = Some(candidate);
            }
            summary.checkpoint = *guard;
        }

        self.set_state(SyncState::Idle);
        tracing::info!(
            pushed = summary.pushed,
            applied = summary.applied,
            conflicts_resolved = summary.conflicts_resolved,
            conflicts_manual = summary.conflicts_manual,
            "Sync cycle completed"
        );
        summary
    }

    fn fail_cycle(&self, err: SyncError, mut summary: CycleSummary) -> CycleSummary {
        match err {
            SyncError::Network { reason } => {
                self.set_state(SyncState::Offline);
                tracing::warn!(reason = %reason, "Sync cycle fell offline; changes remain queued");
                summary.status = CycleStatus::Offline { reason };
            }
            other => {
                let reason = other.to_string();
                *self.mutex_lock(&self.suspension) = Some(reason.clone());
                self.set_state(SyncState::Idle);
                tracing::error!(reason = %reason, "Sync suspended until manually cleared");
                summary.status = CycleStatus::Suspended { reason };
            }
        }
        summary
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    async fn push_phase(
        &self,
        summary: &mut CycleSummary,
        conflicts: &mut Vec<ConflictPair>,
    ) -> Result<(), SyncError> {
        let mut attempted: HashSet<ItemId> = HashSet::new();

        loop {
            let batch = self.queue.next_batch(self.config.batch_size).await;
            let items: Vec<SyncItem> = batch
                .iter()
                .filter(|change| !attempted.contains(&change.item.id))
                .map(|change| change.item.clone())
                .collect();
            if items.is_empty() {
                break;
            }
            attempted.extend(items.iter().map(|item| item.id));
            let batch_ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();

            let request = PushRequest { items };
            let response = match self
                .with_retry("push", || self.transport.push(&request))
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    // Unacknowledged: the whole batch stays queued for the
                    // next cycle with its attempt counts incremented.
                    let failed = self.queue.record_failure(&batch_ids).await;
                    summary
                        .newly_failed
                        .extend(failed.iter().map(|change| change.item.id));
                    return Err(err);
                }
            };

            let mut acked: Vec<ItemId> = Vec::new();
            let mut rejected: Vec<ItemId> = Vec::new();
            for result in &response.results {
                if result.success {
                    acked.push(result.id);
                } else {
                    let reason = result.error.clone().unwrap_or_else(|| "rejected".to_string());
                    tracing::warn!(item_id = %result.id, reason = %reason, "Push item rejected");
                    rejected.push(result.id);
                }
            }

            for change in self.queue.acknowledge(&acked).await {
                self.store
                    .mark_clean(change.item.id, change.item.data_type)
                    .await?;
                summary.pushed += 1;
            }

            let newly_failed = self.queue.record_failure(&rejected).await;
            for change in &newly_failed {
                tracing::warn!(
                    item_id = %change.item.id,
                    attempts = change.attempt_count,
                    "Push item failed permanently"
                );
            }
            summary
                .newly_failed
                .extend(newly_failed.iter().map(|change| change.item.id));

            // The server already holds a newer version of these; the queued
            // push is superseded by whatever resolution decides.
            for conflict in response.conflicts {
                self.queue
                    .remove(conflict.id, conflict.local_version.data_type)
                    .await;
                conflicts.push((conflict.local_version, conflict.server_version));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    async fn pull_phase(
        &self,
        summary: &mut CycleSummary,
        conflicts: &mut Vec<ConflictPair>,
    ) -> Result<Option<Timestamp>, SyncError> {
        let since = self.checkpoint();
        let mut candidate: Option<Timestamp> = None;

        for data_type in DataType::ALL {
            let mut cursor: Option<String> = None;
            loop {
                let request = PullRequest {
                    data_type,
                    since_timestamp: since,
                    cursor: cursor.clone(),
                    limit: self.config.batch_size,
                };
                let response = self
                    .with_retry("pull", || self.transport.pull(&request))
                    .await?;

                for item in response.items {
                    self.ingest_remote_item(item, since, summary, conflicts)
                        .await?;
                }

                candidate = match candidate {
                    Some(current) => Some(current.max(response.server_timestamp)),
                    None => Some(response.server_timestamp),
                };

                if !response.has_more {
                    break;
                }
                cursor = response.next_cursor;
                if cursor.is_none() {
                    // Server claimed more pages but sent no cursor.
                    break;
                }
            }
        }
        Ok(candidate)
    }

    async fn ingest_remote_item(
        &self,
        item: SyncItem,
        since: Option<Timestamp>,
        summary: &mut CycleSummary,
        conflicts: &mut Vec<ConflictPair>,
    ) -> Result<(), SyncError> {
        if self.store.is_dirty(item.id, item.data_type).await? {
            if let Some(local) = self.store.get(item.id, item.data_type).await? {
                let local_newer_than_checkpoint =
                    since.map(|cp| local.timestamp > cp).unwrap_or(true);
                if local_newer_than_checkpoint {
                    conflicts.push((local, item));
                    return Ok(());
                }
            }
        }
        self.store.apply_remote(&item).await?;
        summary.applied += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolve
    // ------------------------------------------------------------------

    async fn resolve_phase(
        &self,
        conflicts: Vec<ConflictPair>,
        summary: &mut CycleSummary,
    ) -> Result<(), SyncError> {
        let detected_at = Utc::now();
        for (local, server) in conflicts {
            match self.resolver.resolve(&local, &server, detected_at) {
                Resolution::Resolved { item, strategy } => {
                    self.apply_resolution(&local, item, strategy).await?;
                    summary.conflicts_resolved += 1;
                }
                Resolution::NeedsManual(info) => {
                    tracing::info!(
                        item_id = %info.local_version.id,
                        data_type = %info.local_version.data_type,
                        "Conflict queued for user decision"
                    );
                    self.mutex_lock(&self.manual_conflicts).push(info);
                    summary.conflicts_manual += 1;
                }
            }
        }
        Ok(())
    }

    async fn apply_resolution(
        &self,
        local: &SyncItem,
        resolved: SyncItem,
        strategy: ResolutionStrategy,
    ) -> Result<(), SyncError> {
        let local_content_won = match strategy {
            ResolutionStrategy::UseLocal | ResolutionStrategy::Merge => true,
            ResolutionStrategy::LatestWins => resolved == *local,
            ResolutionStrategy::UseServer | ResolutionStrategy::Manual => false,
        };

        if local_content_won {
            // The resolved value still differs from what the server holds;
            // keep it dirty and push it next cycle.
            self.store.apply_local(&resolved).await?;
            self.queue.enqueue(resolved, Utc::now()).await;
        } else {
            self.queue.remove(local.id, local.data_type).await;
            self.store.apply_remote(&resolved).await?;
        }
        Ok(())
    }

    /// Apply the user's decision for a conflict parked by the resolver.
    pub async fn resolve_manual(
        &self,
        id: ItemId,
        data_type: DataType,
        keep_local: bool,
    ) -> Result<Option<SyncItem>, SyncError> {
        let conflict = {
            let mut parked = self.mutex_lock(&self.manual_conflicts);
            let position = parked
                .iter()
                .position(|info| info.record_key() == (id, data_type));
            match position {
                Some(index) => parked.remove(index),
                None => return Ok(None),
            }
        };

        let winner = if keep_local {
            conflict.local_version
        } else {
            conflict.server_version
        };
        let strategy = if keep_local {
            ResolutionStrategy::UseLocal
        } else {
            ResolutionStrategy::UseServer
        };
        self.apply_resolution(&winner, winner.clone(), strategy)
            .await?;
        Ok(Some(winner))
    }

    // ------------------------------------------------------------------
    // Realtime integration
    // ------------------------------------------------------------------

    /// Feed one channel event through the same ingest/resolve paths the
    /// batch cycle uses.
    pub async fn handle_realtime_event(&self, event: ChannelEvent) -> Result<(), SyncError> {
        match event {
            ChannelEvent::Connected => {
                tracing::info!("Realtime channel up");
            }
            ChannelEvent::ItemReceived(item) => {
                let since = self.checkpoint();
                let mut summary = CycleSummary::empty();
                let mut conflicts = Vec::new();
                self.ingest_remote_item(item, since, &mut summary, &mut conflicts)
                    .await?;
                if !conflicts.is_empty() {
                    self.resolve_phase(conflicts, &mut summary).await?;
                }
            }
            ChannelEvent::AckConfirmed { item_id, success } => {
                if success {
                    for change in self.queue.acknowledge(&[item_id]).await {
                        self.store
                            .mark_clean(change.item.id, change.item.data_type)
                            .await?;
                    }
                } else {
                    let failed = self.queue.record_failure(&[item_id]).await;
                    for change in &failed {
                        tracing::warn!(item_id = %change.item.id, "Item refused over realtime");
                    }
                }
            }
            ChannelEvent::RemoteError {
                code,
                message,
                recoverable,
            } => {
                tracing::warn!(code = %code, recoverable, "Realtime error: {message}");
            }
            ChannelEvent::Disconnected { error } => {
                tracing::debug!(error = %error, "Realtime channel down");
            }
            ChannelEvent::GaveUp { attempts } => {
                tracing::warn!(
                    attempts,
                    "Realtime channel gave up; continuing on batch cycles"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut failures: u32 = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if failures > 0 {
                        tracing::debug!(operation, failures, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err @ SyncError::Network { .. }) => {
                    failures += 1;
                    if !self.config.retry.attempts_remaining(failures) {
                        return Err(err);
                    }
                    let delay = self.config.retry.jittered_delay_for(failures - 1);
                    tracing::warn!(
                        operation,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient network error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn set_state(&self, next: SyncState) {
        let mut guard = self.write_lock(&self.state);
        let previous = *guard;
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Sync state transition");
            *guard = next;
        }
    }

    fn read_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutex_lock<'a, T>(&self, lock: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Periodic batch sync loop. Runs until the shutdown signal flips true.
pub async fn sync_task(manager: Arc<SyncManager>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut cycle_interval = interval(manager.config.cycle_interval);
    cycle_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = manager.config.cycle_interval.as_secs(),
        "Sync task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Sync task shutting down");
                    break;
                }
            }
            _ = cycle_interval.tick() => {
                let summary = manager.sync_now().await;
                if let CycleStatus::Offline { reason } = &summary.status {
                    tracing::debug!(reason = %reason, "Still offline; will retry next cycle");
                }
            }
        }
    }
}

/// Pump realtime channel events into the manager until shutdown.
pub async fn realtime_pump_task(
    manager: Arc<SyncManager>,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Err(err) = manager.handle_realtime_event(event).await {
                            tracing::error!(error = %err, "Failed to process realtime event");
                        }
                    }
                    None => break,
                }
            }
        }
    }
}
