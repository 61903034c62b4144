//! User-owned contribution settings.
//!
//! Settings are one immutable value. Updates replace the whole value through
//! [`SettingsHandle`] - there is no partial-field mutation path, so readers
//! can never observe a half-applied update.

use crate::error::ConfigError;
use crate::identity::Timestamp;
use crate::task::TaskCategory;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

// ============================================================================
// SETTINGS VALUE
// ============================================================================

/// Conditions under which this device donates idle capacity.
///
/// Every field defaults to its most conservative value. The master `enabled`
/// flag can only become true together with a recorded terms acknowledgement
/// (enforced by the builder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionSettings {
    /// Master switch. Nothing runs while this is false.
    pub enabled: bool,
    /// When the user explicitly acknowledged the contribution terms.
    pub terms_acknowledged_at: Option<Timestamp>,

    // Resource ceilings
    pub max_cpu_percent: f32,
    pub max_ram_mb: u64,
    pub max_bandwidth_kbps: u64,

    // Temporal constraints
    pub require_system_idle: bool,
    pub idle_before_contribution_seconds: u64,
    /// Inclusive start hour and exclusive end hour, local time. `None` means
    /// any hour. A window wrapping midnight is expressed as start > end.
    pub allowed_hours: Option<(u8, u8)>,
    /// Empty means every weekday is allowed.
    pub allowed_weekdays: Vec<Weekday>,

    // Power constraints
    pub require_external_power: bool,
    pub min_battery_percent: f32,

    /// Abort running work the moment user activity is detected.
    pub stop_on_user_activity: bool,

    /// Explicit allow-list. Empty means no task may run.
    pub allowed_categories: Vec<TaskCategory>,
}

impl Default for ContributionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            terms_acknowledged_at: None,
            max_cpu_percent: 25.0,
            max_ram_mb: 512,
            max_bandwidth_kbps: 1024,
            require_system_idle: true,
            idle_before_contribution_seconds: 300,
            allowed_hours: None,
            allowed_weekdays: Vec::new(),
            require_external_power: true,
            min_battery_percent: 50.0,
            stop_on_user_activity: true,
            allowed_categories: Vec::new(),
        }
    }
}

impl ContributionSettings {
    pub fn builder() -> ContributionSettingsBuilder {
        ContributionSettingsBuilder::default()
    }

    /// Whether `weekday` is inside the configured allow-list.
    pub fn weekday_allowed(&self, weekday: Weekday) -> bool {
        self.allowed_weekdays.is_empty() || self.allowed_weekdays.contains(&weekday)
    }

    /// Whether local `hour` falls inside the configured window.
    pub fn hour_allowed(&self, hour: u8) -> bool {
        match self.allowed_hours {
            None => true,
            Some((start, end)) if start <= end => hour >= start && hour < end,
            // Window wraps midnight, e.g. (22, 6)
            Some((start, end)) => hour >= start || hour < end,
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`ContributionSettings`]. `build()` validates ranges and the
/// enable/acknowledgement coupling.
#[derive(Debug, Clone, Default)]
pub struct ContributionSettingsBuilder {
    settings: ContributionSettings,
}

impl ContributionSettingsBuilder {
    /// Turn the master switch on. Requires the acknowledgement timestamp of
    /// the explicit user action; there is no other way to enable.
    pub fn enable_with_acknowledgement(mut self, acknowledged_at: Timestamp) -> Self {
        self.settings.enabled = true;
        self.settings.terms_acknowledged_at = Some(acknowledged_at);
        self
    }

    pub fn max_cpu_percent(mut self, value: f32) -> Self {
        self.settings.max_cpu_percent = value;
        self
    }

    pub fn max_ram_mb(mut self, value: u64) -> Self {
        self.settings.max_ram_mb = value;
        self
    }

    pub fn max_bandwidth_kbps(mut self, value: u64) -> Self {
        self.settings.max_bandwidth_kbps = value;
        self
    }

    pub fn require_system_idle(mut self, value: bool) -> Self {
        self.settings.require_system_idle = value;
        self
    }

    pub fn idle_before_contribution_seconds(mut self, value: u64) -> Self {
        self.settings.idle_before_contribution_seconds = value;
        self
    }

    pub fn allowed_hours(mut self, start: u8, end: u8) -> Self {
        self.settings.allowed_hours = Some((start, end));
        self
    }

    pub fn allowed_weekdays(mut self, weekdays: Vec<Weekday>) -> Self {
        self.settings.allowed_weekdays = weekdays;
        self
    }

    pub fn require_external_power(mut self, value: bool) -> Self {
        self.settings.require_external_power = value;
        self
    }

    pub fn min_battery_percent(mut self, value: f32) -> Self {
        self.settings.min_battery_percent = value;
        self
    }

    pub fn stop_on_user_activity(mut self, value: bool) -> Self {
        self.settings.stop_on_user_activity = value;
        self
    }

    pub fn allowed_categories(mut self, categories: Vec<TaskCategory>) -> Self {
        self.settings.allowed_categories = categories;
        self
    }

    pub fn build(self) -> Result<ContributionSettings, ConfigError> {
        let s = self.settings;
        if s.enabled && s.terms_acknowledged_at.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "enabled",
                reason: "cannot enable without a recorded terms acknowledgement".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&s.max_cpu_percent) {
            return Err(ConfigError::InvalidValue {
                field: "max_cpu_percent",
                reason: format!("{} is outside 0..=100", s.max_cpu_percent),
            });
        }
        if !(0.0..=100.0).contains(&s.min_battery_percent) {
            return Err(ConfigError::InvalidValue {
                field: "min_battery_percent",
                reason: format!("{} is outside 0..=100", s.min_battery_percent),
            });
        }
        if let Some((start, end)) = s.allowed_hours {
            if start > 23 || end > 24 {
                return Err(ConfigError::InvalidValue {
                    field: "allowed_hours",
                    reason: format!("({start}, {end}) is outside the 24-hour clock"),
                });
            }
        }
        Ok(s)
    }
}

// ============================================================================
// SHARED HANDLE
// ============================================================================

/// Shared read access to the current settings value.
///
/// Readers get an `Arc` snapshot; the single update path swaps the whole
/// value. A reader holding an old `Arc` simply finishes its evaluation
/// against the settings that were current when it started.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<ContributionSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: ContributionSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// The current settings value.
    pub fn current(&self) -> Arc<ContributionSettings> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Atomically replace the settings value.
    pub fn replace(&self, settings: ContributionSettings) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(settings);
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(ContributionSettings::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
