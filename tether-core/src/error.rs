//! Error types for TETHER operations.
//!
//! Conflicts and permission denials are NOT errors - they are ordinary
//! control-flow values (`ConflictInfo`, `PermissionDecision::Denied`) and
//! never appear here.

use crate::identity::ItemId;
use thiserror::Error;

/// Pending change queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Fatal local corruption. Sync is suspended until the operator clears
    /// the queue; queued changes are surfaced, never silently discarded.
    #[error("Pending queue corrupt: {reason}")]
    Corrupt { reason: String },
}

/// Sync engine errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient transport failure. Retried with backoff; repeated failure
    /// drops the cycle into offline mode.
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// The server rejected the item as invalid. Permanent - surfaced to the
    /// caller, never retried.
    #[error("Item {id} rejected by server: {reason}")]
    RemoteRejected { id: ItemId, reason: String },

    /// The item failed more push attempts than the configured ceiling.
    #[error("Item {id} failed after {attempts} attempts")]
    AttemptsExhausted { id: ItemId, attempts: u32 },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Local replica store failure.
    #[error("Store error: {reason}")]
    Store { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Realtime channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connect failed: {reason}")]
    Connect { reason: String },

    #[error("Authentication rejected: {reason}")]
    AuthRejected { reason: String },

    /// No acknowledgement arrived within the bounded timeout. The caller
    /// must fall back to batch sync for this item.
    #[error("No ack for item {item_id} within the delivery timeout")]
    AckTimeout { item_id: ItemId },

    #[error("Remote missed {missed} consecutive heartbeats")]
    HeartbeatLost { missed: u32 },

    /// Reconnect attempts are exhausted; the channel stays down until an
    /// explicit reconnect and the sync manager continues on batch cycles.
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Channel closed")]
    Closed,

    #[error("Envelope decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all TETHER errors.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for TETHER operations.
pub type TetherResult<T> = Result<T, TetherError>;

// ============================================================================
// TESTS
// ============================================================================
