//! End-to-end sync cycle behavior against a scripted transport.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_core::{DataType, RetryPolicy, SyncConfig, SyncError, SyncItem, SyncOperation};
use tether_sync::{
    ConflictResolver, CycleStatus, InMemoryItemStore, ItemStore, PendingQueue, PullRequest,
    PullResponse, PushConflict, PushItemResult, PushRequest, PushResponse, SyncManager, SyncState,
    SyncTransport,
};

fn server_clock(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + offset_secs, 0).unwrap()
}

fn memory_item(id: uuid::Uuid, content: &str, tags: &[&str], at: DateTime<Utc>) -> SyncItem {
    SyncItem::new(
        id,
        DataType::MemoryRecord,
        SyncOperation::Update,
        json!({ "content": content, "tags": tags }),
        at,
    )
}

/// Transport with scripted per-call responses. Unscripted calls succeed
/// with empty/accepting defaults.
#[derive(Default)]
struct ScriptedTransport {
    pull_scripts: Mutex<HashMap<DataType, VecDeque<Result<PullResponse, SyncError>>>>,
    push_scripts: Mutex<VecDeque<Result<PushResponse, SyncError>>>,
    push_log: Mutex<Vec<PushRequest>>,
    pull_log: Mutex<Vec<PullRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    push_delay: Option<std::time::Duration>,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self::default()
    }

    fn script_pull(&self, data_type: DataType, response: Result<PullResponse, SyncError>) {
        self.pull_scripts
            .lock()
            .unwrap()
            .entry(data_type)
            .or_default()
            .push_back(response);
    }

    fn script_push(&self, response: Result<PushResponse, SyncError>) {
        self.push_scripts.lock().unwrap().push_back(response);
    }

    fn empty_pull(at: DateTime<Utc>) -> PullResponse {
        PullResponse {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
            server_timestamp: at,
        }
    }

    fn accept_all(request: &PushRequest) -> PushResponse {
        PushResponse {
            results: request
                .items
                .iter()
                .map(|item| PushItemResult {
                    id: item.id,
                    success: true,
                    error: None,
                })
                .collect(),
            conflicts: Vec::new(),
        }
    }

    fn pushed_requests(&self) -> Vec<PushRequest> {
        self.push_log.lock().unwrap().clone()
    }

    fn pull_count(&self) -> usize {
        self.pull_log.lock().unwrap().len()
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, SyncError> {
        self.pull_log.lock().unwrap().push(request.clone());
        let scripted = self
            .pull_scripts
            .lock()
            .unwrap()
            .get_mut(&request.data_type)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(response) => response,
            None => Ok(Self::empty_pull(server_clock(0))),
        }
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.push_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.push_log.lock().unwrap().push(request.clone());
        let scripted = self.push_scripts.lock().unwrap().pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(Self::accept_all(request)),
        }
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        max_item_attempts: 2,
        retry: RetryPolicy {
            max_attempts: 1,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            multiplier: 2.0,
            jitter: std::time::Duration::ZERO,
        },
        ..SyncConfig::default()
    }
}

fn build_manager(
    transport: Arc<ScriptedTransport>,
    resolver: ConflictResolver,
) -> (Arc<SyncManager>, Arc<InMemoryItemStore>, Arc<PendingQueue>) {
    let config = test_config();
    let queue = Arc::new(PendingQueue::new(config.max_item_attempts));
    let store = Arc::new(InMemoryItemStore::new());
    let manager = Arc::new(SyncManager::new(
        config,
        queue.clone(),
        store.clone(),
        transport,
        resolver,
    ));
    (manager, store, queue)
}

// ============================================================================
// PUSH BEFORE PULL
// ============================================================================

#[tokio::test]
async fn pushed_item_does_not_return_as_phantom_conflict() {
    let transport = Arc::new(ScriptedTransport::new());
    let item = memory_item(uuid::Uuid::now_v7(), "note", &["a"], server_clock(10));

    // The server echoes our own item back in the pull, as a real remote does.
    transport.script_pull(
        DataType::MemoryRecord,
        Ok(PullResponse {
            items: vec![item.clone()],
            next_cursor: None,
            has_more: false,
            server_timestamp: server_clock(20),
        }),
    );

    let (manager, store, queue) = build_manager(transport, ConflictResolver::new());
    manager.enqueue_local(item.clone()).await.unwrap();

    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.pushed, 1);
    assert_eq!(summary.conflicts_resolved + summary.conflicts_manual, 0);
    assert!(queue.is_empty().await);
    assert!(!store
        .is_dirty(item.id, DataType::MemoryRecord)
        .await
        .unwrap());
    assert_eq!(manager.state(), SyncState::Idle);
}

// ============================================================================
// DEDUPLICATED PUSH
// ============================================================================

#[tokio::test]
async fn same_item_enqueued_twice_pushes_once() {
    let transport = Arc::new(ScriptedTransport::new());
    let (manager, _store, _queue) = build_manager(transport.clone(), ConflictResolver::new());

    let id = uuid::Uuid::now_v7();
    manager
        .enqueue_local(memory_item(id, "first", &[], server_clock(1)))
        .await
        .unwrap();
    manager
        .enqueue_local(memory_item(id, "second", &[], server_clock(2)))
        .await
        .unwrap();

    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.pushed, 1);

    let pushes = transport.pushed_requests();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].items.len(), 1);
    assert_eq!(pushes[0].items[0].payload["content"], "second");
}

// ============================================================================
// BATCH WITH ONE REJECTION
// ============================================================================

#[tokio::test]
async fn rejected_item_survives_until_attempt_ceiling() {
    let transport = Arc::new(ScriptedTransport::new());
    let (manager, _store, queue) = build_manager(transport.clone(), ConflictResolver::new());

    let mut ids = Vec::new();
    for index in 0..50 {
        let item = memory_item(
            uuid::Uuid::now_v7(),
            &format!("note {index}"),
            &[],
            server_clock(index),
        );
        ids.push(item.id);
        manager.enqueue_local(item).await.unwrap();
    }
    let rejected_id = ids[29];

    let reject_one = |request: &PushRequest| PushResponse {
        results: request
            .items
            .iter()
            .map(|item| PushItemResult {
                id: item.id,
                success: item.id != rejected_id,
                error: (item.id == rejected_id).then(|| "schema validation failed".to_string()),
            })
            .collect(),
        conflicts: Vec::new(),
    };

    // First cycle: 49 acknowledged, the rejected one stays queued.
    transport.script_push(Ok(reject_one(&PushRequest {
        items: (0..50)
            .map(|i| memory_item(ids[i], "x", &[], server_clock(0)))
            .collect(),
    })));
    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.pushed, 49);
    assert!(summary.newly_failed.is_empty());
    assert_eq!(queue.pending_count().await, 1);

    // Second cycle: the retry ceiling (2 attempts) is reached and the item
    // is surfaced as a permanent failure.
    let second = queue.next_batch(10).await;
    assert_eq!(second[0].item.id, rejected_id);
    assert_eq!(second[0].attempt_count, 1);

    transport.script_push(Ok(PushResponse {
        results: vec![PushItemResult {
            id: rejected_id,
            success: false,
            error: Some("schema validation failed".to_string()),
        }],
        conflicts: Vec::new(),
    }));
    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.newly_failed, vec![rejected_id]);
    assert_eq!(queue.pending_count().await, 0);
    assert_eq!(queue.failed_items().await.len(), 1);
}

// ============================================================================
// MONOTONIC CHECKPOINT
// ============================================================================

#[tokio::test]
async fn checkpoint_survives_partial_failure_and_never_decreases() {
    let transport = Arc::new(ScriptedTransport::new());
    let (manager, _store, _queue) = build_manager(transport.clone(), ConflictResolver::new());

    // Cycle 1 completes and records T+100.
    for data_type in DataType::ALL {
        transport.script_pull(data_type, Ok(ScriptedTransport::empty_pull(server_clock(100))));
    }
    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(manager.checkpoint(), Some(server_clock(100)));

    // Cycle 2 fails mid-pull; the checkpoint must not move.
    transport.script_pull(
        DataType::MemoryRecord,
        Err(SyncError::Network {
            reason: "unreachable".to_string(),
        }),
    );
    let summary = manager.sync_now().await;
    assert!(matches!(summary.status, CycleStatus::Offline { .. }));
    assert_eq!(manager.checkpoint(), Some(server_clock(100)));
    assert!(manager.is_offline());

    // Cycle 3 succeeds but the server clock reads earlier than the recorded
    // checkpoint; the checkpoint still must not decrease.
    for data_type in DataType::ALL {
        transport.script_pull(data_type, Ok(ScriptedTransport::empty_pull(server_clock(50))));
    }
    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(manager.checkpoint(), Some(server_clock(100)));
    assert_eq!(manager.state(), SyncState::Idle);
}

// ============================================================================
// TWO-DEVICE MERGE
// ============================================================================

#[tokio::test]
async fn conflicting_memory_records_merge_longest_content_and_tag_union() {
    let transport = Arc::new(ScriptedTransport::new());
    let (manager, store, queue) = build_manager(transport.clone(), ConflictResolver::new());

    let id = uuid::Uuid::now_v7();
    // Device A (this device) wrote the longer text.
    let local = memory_item(
        id,
        "the quick brown fox jumped over the lazy dog",
        &["home", "ideas"],
        server_clock(200),
    );
    let server = memory_item(id, "quick note", &["ideas", "work"], server_clock(150));

    manager.enqueue_local(local.clone()).await.unwrap();
    transport.script_push(Ok(PushResponse {
        results: Vec::new(),
        conflicts: vec![PushConflict {
            id,
            local_version: local.clone(),
            server_version: server.clone(),
            suggested_resolution: tether_core::ResolutionStrategy::Merge,
        }],
    }));

    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.conflicts_resolved, 1);
    assert_eq!(summary.conflicts_manual, 0);

    let merged = store
        .get(id, DataType::MemoryRecord)
        .await
        .unwrap()
        .expect("merged record present");
    assert_eq!(
        merged.payload["content"],
        "the quick brown fox jumped over the lazy dog"
    );
    assert_eq!(merged.payload["tags"], json!(["home", "ideas", "work"]));
    assert_eq!(merged.timestamp, server_clock(200));

    // The merged result differs from what the server holds, so it is queued
    // for the next push.
    assert_eq!(queue.pending_count().await, 1);
}

// ============================================================================
// MANUAL CONFLICTS
// ============================================================================

#[tokio::test]
async fn manual_policy_parks_conflict_without_blocking_the_cycle() {
    let transport = Arc::new(ScriptedTransport::new());
    let resolver = ConflictResolver::new().with_manual_type(DataType::MemoryRecord);
    let (manager, store, queue) = build_manager(transport.clone(), resolver);

    let id = uuid::Uuid::now_v7();
    let local = memory_item(id, "mine", &[], server_clock(300));
    let server = memory_item(id, "theirs", &[], server_clock(250));

    manager.enqueue_local(local.clone()).await.unwrap();
    transport.script_push(Ok(PushResponse {
        results: Vec::new(),
        conflicts: vec![PushConflict {
            id,
            local_version: local.clone(),
            server_version: server.clone(),
            suggested_resolution: tether_core::ResolutionStrategy::Manual,
        }],
    }));

    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.conflicts_manual, 1);

    let parked = manager.manual_conflicts();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].record_key(), (id, DataType::MemoryRecord));

    // The user keeps the local version: it is applied and queued for push.
    let winner = manager
        .resolve_manual(id, DataType::MemoryRecord, true)
        .await
        .unwrap()
        .expect("conflict existed");
    assert_eq!(winner.payload["content"], "mine");
    assert!(manager.manual_conflicts().is_empty());
    assert_eq!(queue.pending_count().await, 1);
    assert!(store.is_dirty(id, DataType::MemoryRecord).await.unwrap());
}

// ============================================================================
// FATAL LOCAL FAILURE SUSPENDS SYNC
// ============================================================================

/// Store that can be told to fail applies, simulating local corruption.
struct FlakyStore {
    inner: InMemoryItemStore,
    fail_applies: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ItemStore for FlakyStore {
    async fn get(
        &self,
        id: uuid::Uuid,
        data_type: DataType,
    ) -> Result<Option<SyncItem>, SyncError> {
        self.inner.get(id, data_type).await
    }

    async fn apply_remote(&self, item: &SyncItem) -> Result<(), SyncError> {
        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(SyncError::Store {
                reason: "replica database is unreadable".to_string(),
            });
        }
        self.inner.apply_remote(item).await
    }

    async fn apply_local(&self, item: &SyncItem) -> Result<(), SyncError> {
        self.inner.apply_local(item).await
    }

    async fn mark_clean(&self, id: uuid::Uuid, data_type: DataType) -> Result<(), SyncError> {
        self.inner.mark_clean(id, data_type).await
    }

    async fn is_dirty(&self, id: uuid::Uuid, data_type: DataType) -> Result<bool, SyncError> {
        self.inner.is_dirty(id, data_type).await
    }

    async fn list_dirty(&self) -> Result<Vec<SyncItem>, SyncError> {
        self.inner.list_dirty().await
    }
}

#[tokio::test]
async fn fatal_store_failure_suspends_sync_until_cleared() {
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(FlakyStore {
        inner: InMemoryItemStore::new(),
        fail_applies: std::sync::atomic::AtomicBool::new(true),
    });
    let config = test_config();
    let queue = Arc::new(PendingQueue::new(config.max_item_attempts));
    let manager = Arc::new(SyncManager::new(
        config,
        queue,
        store.clone(),
        transport.clone(),
        ConflictResolver::new(),
    ));

    transport.script_pull(
        DataType::MemoryRecord,
        Ok(PullResponse {
            items: vec![memory_item(uuid::Uuid::now_v7(), "x", &[], server_clock(5))],
            next_cursor: None,
            has_more: false,
            server_timestamp: server_clock(5),
        }),
    );

    let summary = manager.sync_now().await;
    assert!(matches!(summary.status, CycleStatus::Suspended { .. }));
    assert!(manager
        .suspension_reason()
        .unwrap()
        .contains("replica database is unreadable"));
    // No checkpoint was recorded for the broken cycle.
    assert_eq!(manager.checkpoint(), None);

    // While suspended, cycles refuse to touch the network.
    let pulls_before = transport.pull_count();
    let summary = manager.sync_now().await;
    assert!(matches!(summary.status, CycleStatus::Suspended { .. }));
    assert_eq!(transport.pull_count(), pulls_before);

    // Operator repairs the store and clears the suspension.
    store.fail_applies.store(false, Ordering::SeqCst);
    manager.clear_suspension();
    let summary = manager.sync_now().await;
    assert_eq!(summary.status, CycleStatus::Completed);
}

// ============================================================================
// SINGLE CYCLE IN FLIGHT
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sync_now_joins_the_in_flight_cycle() {
    let mut transport = ScriptedTransport::new();
    transport.push_delay = Some(std::time::Duration::from_millis(50));
    let transport = Arc::new(transport);
    let (manager, _store, _queue) = build_manager(transport.clone(), ConflictResolver::new());

    manager
        .enqueue_local(memory_item(
            uuid::Uuid::now_v7(),
            "slow push",
            &[],
            server_clock(1),
        ))
        .await
        .unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.sync_now().await }
    });
    // Give the first call time to take the cycle lock.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.sync_now().await }
    });

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(transport.pushed_requests().len(), 1);
    // One cycle ran: each data type was pulled exactly once.
    assert_eq!(transport.pull_count(), DataType::ALL.len());
}
