//! The unit of replication and its lifecycle wrappers.
//!
//! A [`SyncItem`] describes one mutation of one logical record. The pair
//! `(id, data_type)` uniquely addresses a record across all replicas; the
//! origin-clock `timestamp` is monotonic per origin and drives conflict
//! detection.

use crate::identity::{compute_checksum, ItemId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENUMS
// ============================================================================

/// Closed set of replicated record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Append-only user memory (notes, observations)
    MemoryRecord,
    /// Session logs; the server is the system of record
    SessionRecord,
    /// Ingested knowledge; the server is the system of record
    KnowledgeChunk,
    /// Device-local preference values
    Setting,
}

impl DataType {
    /// All replicated types, in pull order.
    pub const ALL: [DataType; 4] = [
        DataType::MemoryRecord,
        DataType::SessionRecord,
        DataType::KnowledgeChunk,
        DataType::Setting,
    ];
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::MemoryRecord => "memory_record",
            DataType::SessionRecord => "session_record",
            DataType::KnowledgeChunk => "knowledge_chunk",
            DataType::Setting => "setting",
        };
        f.write_str(s)
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory_record" => Ok(DataType::MemoryRecord),
            "session_record" => Ok(DataType::SessionRecord),
            "knowledge_chunk" => Ok(DataType::KnowledgeChunk),
            "setting" => Ok(DataType::Setting),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

/// Mutation kind carried by a sync item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Strategy the resolver picked (or suggests) for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Field-level merge of both versions
    Merge,
    /// Discard the local version
    UseServer,
    /// Keep the local version
    UseLocal,
    /// Most recent origin timestamp wins, server breaks ties
    LatestWins,
    /// Queue for an explicit user decision
    Manual,
}

// ============================================================================
// SYNC ITEM
// ============================================================================

/// One replicated mutation. Wire shape:
/// `{id, data_type, operation, payload, timestamp, checksum}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: ItemId,
    pub data_type: DataType,
    pub operation: SyncOperation,
    /// Opaque serialized record value. `Null` for deletes.
    pub payload: serde_json::Value,
    /// Origin clock, monotonic per origin.
    pub timestamp: Timestamp,
    /// Hex SHA-256 of the canonical payload bytes.
    pub checksum: String,
}

impl SyncItem {
    /// Build an item, deriving the checksum from the payload.
    pub fn new(
        id: ItemId,
        data_type: DataType,
        operation: SyncOperation,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        let checksum = checksum_of(&payload);
        Self {
            id,
            data_type,
            operation,
            payload,
            timestamp,
            checksum,
        }
    }

    /// Build a delete marker. Delete payloads are empty by contract.
    pub fn deletion(id: ItemId, data_type: DataType, timestamp: Timestamp) -> Self {
        Self::new(
            id,
            data_type,
            SyncOperation::Delete,
            serde_json::Value::Null,
            timestamp,
        )
    }

    /// Re-derive the checksum and compare against the carried one.
    pub fn verify_checksum(&self) -> bool {
        checksum_of(&self.payload) == self.checksum
    }

    /// The logical record this item addresses.
    pub fn record_key(&self) -> (ItemId, DataType) {
        (self.id, self.data_type)
    }
}

fn checksum_of(payload: &serde_json::Value) -> String {
    // serde_json sorts object keys, so the serialization is canonical.
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    compute_checksum(&bytes)
}

// ============================================================================
// QUEUE AND CONFLICT WRAPPERS
// ============================================================================

/// A sync item awaiting remote acknowledgement. Owned exclusively by the
/// pending change queue until acked, then removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub item: SyncItem,
    pub queued_at: Timestamp,
    pub attempt_count: u32,
}

impl PendingChange {
    pub fn new(item: SyncItem, queued_at: Timestamp) -> Self {
        Self {
            item,
            queued_at,
            attempt_count: 0,
        }
    }
}

/// A dirty local item paired with a newer server version of the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub local_version: SyncItem,
    pub server_version: SyncItem,
    pub suggested_resolution: ResolutionStrategy,
    pub detected_at: Timestamp,
}

impl ConflictInfo {
    /// The logical record both versions address.
    pub fn record_key(&self) -> (ItemId, DataType) {
        self.local_version.record_key()
    }
}

// ============================================================================
// TESTS
// ============================================================================
