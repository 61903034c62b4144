//! Request/response shapes for the batch sync protocol.
//!
//! These mirror the remote service's JSON contract exactly; the transport
//! layer moves them without interpretation.

use serde::{Deserialize, Serialize};
use tether_core::{DataType, ItemId, ResolutionStrategy, SyncItem, Timestamp};

// ============================================================================
// PULL
// ============================================================================

/// One page of changes for one data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub data_type: DataType,
    /// Changes strictly after this server timestamp. `None` on first sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub items: Vec<SyncItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// The server clock at page production; the cycle checkpoint candidate.
    pub server_timestamp: Timestamp,
}

// ============================================================================
// PUSH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub items: Vec<SyncItem>,
}

/// Per-item outcome of a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushItemResult {
    pub id: ItemId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A push the server could not apply because it holds a newer version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConflict {
    pub id: ItemId,
    pub local_version: SyncItem,
    pub server_version: SyncItem,
    pub suggested_resolution: ResolutionStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushItemResult>,
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
}

// ============================================================================
// TESTS
// ============================================================================
