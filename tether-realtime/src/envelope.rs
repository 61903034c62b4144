//! The realtime message envelope.
//!
//! One tagged sum type covers every message kind on the wire, so a new kind
//! is a compile-time-checked exercise for every receiver, not a runtime
//! string chain.

use serde::{Deserialize, Serialize};
use tether_core::{ItemId, SyncItem, Timestamp};

/// Everything that can travel over the realtime channel, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeMessage {
    /// A sync item propagated outside the batch cycle.
    Item { item: SyncItem },

    /// Acknowledgement for a previously sent item.
    Ack { item_id: ItemId, success: bool },

    /// Periodic liveness signal, sent by both sides.
    Heartbeat { timestamp: Timestamp, health: String },

    /// Remote-reported failure.
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

// ============================================================================
// TESTS
// ============================================================================
