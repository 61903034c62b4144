//! Identity and integrity primitives.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Item identifier, stable across replicas. UUIDv7 embeds a Unix timestamp,
/// making ids naturally sortable by creation time.
pub type ItemId = Uuid;

/// Identifier of a contribution task.
pub type TaskId = Uuid;

/// Identifier of this device, issued during registration (out of scope here).
pub type DeviceId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new timestamp-sortable item id.
pub fn new_item_id() -> ItemId {
    Uuid::now_v7()
}

/// Generate a new timestamp-sortable task id.
pub fn new_task_id() -> TaskId {
    Uuid::now_v7()
}

/// Compute the hex-encoded SHA-256 checksum of serialized payload bytes.
pub fn compute_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_id_is_v7() {
        let id = new_item_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_item_ids_are_sortable() {
        let id1 = new_item_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = new_item_id();
        assert!(id1.to_string() < id2.to_string());
    }

    #[test]
    fn test_checksum_is_stable() {
        let content = b"hello world";
        let a = compute_checksum(content);
        let b = compute_checksum(content);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_differs_for_different_content() {
        assert_ne!(compute_checksum(b"a"), compute_checksum(b"b"));
    }
}
