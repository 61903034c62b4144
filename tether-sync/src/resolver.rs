//! Deterministic conflict resolution.
//!
//! A pure mapping from `(data_type, local_version, server_version)` to a
//! resolution. No hidden state: identical inputs always produce identical
//! outputs, on every device.

use serde_json::Value as JsonValue;
use std::collections::HashSet;
use tether_core::{ConflictInfo, DataType, ResolutionStrategy, SyncItem, SyncOperation, Timestamp};

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The winning item, ready to apply, plus the strategy that produced it.
    Resolved {
        item: SyncItem,
        strategy: ResolutionStrategy,
    },
    /// Policy refuses to guess; the conflict is queued for a user decision.
    NeedsManual(ConflictInfo),
}

/// Per-type resolution policy.
///
/// - Append-only user data merges field by field.
/// - Server-of-record types take the server version.
/// - Device-local preference types keep the local version.
/// - Everything else falls back to most-recent-timestamp, server winning
///   ties (the server is the single point of truth across devices).
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    /// Types the operator marked as requiring a human decision.
    manual_types: HashSet<DataType>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `data_type` as manual-only: conflicts on it are never
    /// auto-resolved.
    pub fn with_manual_type(mut self, data_type: DataType) -> Self {
        self.manual_types.insert(data_type);
        self
    }

    /// The strategy this resolver would apply to a conflict on `data_type`.
    pub fn suggest(&self, data_type: DataType) -> ResolutionStrategy {
        if self.manual_types.contains(&data_type) {
            return ResolutionStrategy::Manual;
        }
        match data_type {
            DataType::MemoryRecord => ResolutionStrategy::Merge,
            DataType::SessionRecord | DataType::KnowledgeChunk => ResolutionStrategy::UseServer,
            DataType::Setting => ResolutionStrategy::UseLocal,
        }
    }

    /// Resolve a conflict between a dirty local item and a newer server
    /// item for the same `(id, data_type)`.
    pub fn resolve(
        &self,
        local: &SyncItem,
        server: &SyncItem,
        detected_at: Timestamp,
    ) -> Resolution {
        let strategy = self.suggest(local.data_type);
        match strategy {
            ResolutionStrategy::Manual => Resolution::NeedsManual(ConflictInfo {
                local_version: local.clone(),
                server_version: server.clone(),
                suggested_resolution: ResolutionStrategy::Manual,
                detected_at,
            }),
            ResolutionStrategy::Merge => {
                // A delete on either side leaves nothing to merge with.
                if !local.payload.is_object() || !server.payload.is_object() {
                    return Resolution::Resolved {
                        item: latest_wins(local, server),
                        strategy: ResolutionStrategy::LatestWins,
                    };
                }
                Resolution::Resolved {
                    item: merge_items(local, server),
                    strategy: ResolutionStrategy::Merge,
                }
            }
            ResolutionStrategy::UseServer => Resolution::Resolved {
                item: server.clone(),
                strategy: ResolutionStrategy::UseServer,
            },
            ResolutionStrategy::UseLocal => Resolution::Resolved {
                item: local.clone(),
                strategy: ResolutionStrategy::UseLocal,
            },
            ResolutionStrategy::LatestWins => Resolution::Resolved {
                item: latest_wins(local, server),
                strategy: ResolutionStrategy::LatestWins,
            },
        }
    }
}

/// Most-recent origin timestamp wins; the server breaks ties.
fn latest_wins(local: &SyncItem, server: &SyncItem) -> SyncItem {
    if local.timestamp > server.timestamp {
        local.clone()
    } else {
        server.clone()
    }
}

/// Field-level merge for append-only record payloads:
/// - array-valued fields take the union (local order first, new remote
///   elements appended in remote order)
/// - string-valued fields keep the longer content, server winning ties
/// - other scalars come from the newer version
/// - the resolved timestamp is the max of both inputs
fn merge_items(local: &SyncItem, server: &SyncItem) -> SyncItem {
    let local_map = local.payload.as_object().cloned().unwrap_or_default();
    let server_map = server.payload.as_object().cloned().unwrap_or_default();
    let newer_is_local = local.timestamp > server.timestamp;

    let mut merged = serde_json::Map::new();
    for (key, local_value) in &local_map {
        match server_map.get(key) {
            None => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(server_value) => {
                merged.insert(key.clone(), merge_field(local_value, server_value, newer_is_local));
            }
        }
    }
    for (key, server_value) in &server_map {
        if !local_map.contains_key(key) {
            merged.insert(key.clone(), server_value.clone());
        }
    }

    let timestamp = local.timestamp.max(server.timestamp);
    SyncItem::new(
        local.id,
        local.data_type,
        SyncOperation::Update,
        JsonValue::Object(merged),
        timestamp,
    )
}

fn merge_field(local: &JsonValue, server: &JsonValue, newer_is_local: bool) -> JsonValue {
    match (local, server) {
        (JsonValue::Array(local_arr), JsonValue::Array(server_arr)) => {
            let mut union = local_arr.clone();
            for value in server_arr {
                if !union.contains(value) {
                    union.push(value.clone());
                }
            }
            JsonValue::Array(union)
        }
        (JsonValue::String(local_str), JsonValue::String(server_str)) => {
            if local_str.len() > server_str.len() {
                JsonValue::String(local_str.clone())
            } else {
                JsonValue::String(server_str.clone())
            }
        }
        _ => {
            if newer_is_local {
                local.clone()
            } else {
                server.clone()
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;
    use serde_json::json;
    use uuid::Uuid;

    fn data_type_strategy() -> impl Strategy<Value = DataType> {
        prop_oneof![
            Just(DataType::MemoryRecord),
            Just(DataType::SessionRecord),
            Just(DataType::KnowledgeChunk),
            Just(DataType::Setting),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Identical `(data_type, local, server)` inputs always produce the
        /// same resolution.
        #[test]
        fn prop_resolution_is_deterministic(
            data_type in data_type_strategy(),
            local_content in "[a-z]{0,24}",
            server_content in "[a-z]{0,24}",
            local_offset in 0i64..600,
            server_offset in 0i64..600,
        ) {
            let id = Uuid::nil();
            let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            let local = SyncItem::new(
                id,
                data_type,
                SyncOperation::Update,
                json!({ "content": local_content }),
                base + chrono::Duration::seconds(local_offset),
            );
            let server = SyncItem::new(
                id,
                data_type,
                SyncOperation::Update,
                json!({ "content": server_content }),
                base + chrono::Duration::seconds(server_offset),
            );
            let detected = base;

            let resolver = ConflictResolver::new();
            let first = resolver.resolve(&local, &server, detected);
            let second = resolver.resolve(&local, &server, detected);
            prop_assert_eq!(first, second);
        }

        /// A merged memory record never loses a tag from either side.
        #[test]
        fn prop_merge_preserves_all_tags(
            local_tags in prop::collection::vec("[a-z]{1,8}", 0..6),
            server_tags in prop::collection::vec("[a-z]{1,8}", 0..6),
        ) {
            let id = Uuid::nil();
            let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            let local = SyncItem::new(
                id,
                DataType::MemoryRecord,
                SyncOperation::Update,
                json!({ "content": "c", "tags": local_tags.clone() }),
                base + chrono::Duration::seconds(1),
            );
            let server = SyncItem::new(
                id,
                DataType::MemoryRecord,
                SyncOperation::Update,
                json!({ "content": "c", "tags": server_tags.clone() }),
                base,
            );

            let resolution = ConflictResolver::new().resolve(&local, &server, base);
            let Resolution::Resolved { item, .. } = resolution else {
                return Err(TestCaseError::fail("expected auto-resolution"));
            };
            let merged: Vec<String> = item.payload["tags"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            for tag in local_tags.iter().chain(server_tags.iter()) {
                prop_assert!(merged.contains(tag));
            }
        }
    }
}
