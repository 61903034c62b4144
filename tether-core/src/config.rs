//! Sync engine configuration.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the sync manager and realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Items per push batch and per pull page.
    pub batch_size: usize,
    /// Push attempts per item before it is marked failed and surfaced.
    pub max_item_attempts: u32,
    /// Interval between batch sync cycles.
    pub cycle_interval: Duration,
    /// Timeout applied to each network call.
    pub request_timeout: Duration,
    /// Whether the realtime channel is used for sub-interval propagation.
    pub realtime_enabled: bool,
    pub heartbeat_interval: Duration,
    /// How long a sent item may wait for its ack before the caller is told
    /// "not delivered".
    pub ack_timeout: Duration,
    /// Consecutive missed remote heartbeats before reconnecting.
    pub max_missed_heartbeats: u32,
    /// Ceiling on one contribution grant's session duration.
    pub max_grant_duration: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_item_attempts: 5,
            cycle_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            realtime_enabled: false,
            heartbeat_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            max_missed_heartbeats: 2,
            max_grant_duration: Duration::from_secs(30 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Validate the configuration. Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_item_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_item_attempts",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.cycle_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "cycle_interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "ack_timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_missed_heartbeats",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_grant_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "max_grant_duration",
                reason: "must be positive".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.retry.multiplier <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
