//! TETHER Sync - Offline-First Replication Engine
//!
//! Keeps the local replica consistent with the remote service across
//! intermittent connectivity:
//!
//! - local mutations accumulate in a durable [`PendingQueue`] until the
//!   remote acknowledges them
//! - the [`SyncManager`] drives push -> pull -> resolve -> checkpoint
//!   cycles, one in flight at a time
//! - the [`ConflictResolver`] maps each conflict deterministically to a
//!   resolution, parking anything its policy refuses to guess
//! - the optional realtime channel shortcuts the batch interval for
//!   individual items, always falling back to batch sync on failure
//!
//! Offline is an explicit, non-alarming state: queued changes stay visible
//! as pending and the next successful cycle re-derives the same idempotent
//! delta.

pub mod manager;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod transport;
pub mod wire;

pub use manager::{
    realtime_pump_task, sync_task, CycleStatus, CycleSummary, SyncManager, SyncState,
};
pub use queue::PendingQueue;
pub use resolver::{ConflictResolver, Resolution};
pub use store::{InMemoryItemStore, ItemStore};
pub use transport::{HttpTransport, SyncTransport, DEVICE_ID_HEADER};
pub use wire::{PullRequest, PullResponse, PushConflict, PushItemResult, PushRequest, PushResponse};
