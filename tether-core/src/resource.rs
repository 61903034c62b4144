//! Point-in-time resource measurements and idle classification.

use crate::identity::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered classification of how deeply idle the device is.
///
/// The derived `Ord` follows declaration order: `Active < Light < Medium <
/// Deep < SleepReady`. Deeper idle admits more background work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IdleDepth {
    Active,
    Light,
    Medium,
    Deep,
    SleepReady,
}

impl fmt::Display for IdleDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdleDepth::Active => "active",
            IdleDepth::Light => "light",
            IdleDepth::Medium => "medium",
            IdleDepth::Deep => "deep",
            IdleDepth::SleepReady => "sleep_ready",
        };
        f.write_str(s)
    }
}

/// One measurement of system load. Immutable once produced; superseded by
/// the next sample, never mutated in place.
///
/// Wire shape for resource reporting:
/// `{cpu_usage_percent, ram_usage_percent, battery_percent?, on_battery,
/// idle_seconds, idle_depth}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: Timestamp,
    pub cpu_usage_percent: f32,
    pub ram_usage_percent: f32,
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    pub on_battery: bool,
    /// Seconds since the last user input event.
    pub idle_seconds: u64,
    pub idle_depth: IdleDepth,
    /// Set when the OS read failed and previous values were carried forward.
    #[serde(default)]
    pub stale: bool,
}

impl ResourceSnapshot {
    /// Whether the user is currently interacting with the device.
    pub fn is_idle(&self) -> bool {
        self.idle_depth > IdleDepth::Active
    }

    /// Free RAM in megabytes.
    pub fn ram_available_mb(&self) -> u64 {
        self.ram_total_mb.saturating_sub(self.ram_used_mb)
    }
}

/// Short-horizon prediction of available capacity. Advisory only - never a
/// hard admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceForecast {
    pub predicted_cpu_available_percent: f32,
    pub predicted_ram_available_mb: u64,
}

// ============================================================================
// TESTS
// ============================================================================
