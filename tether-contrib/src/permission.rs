//! Admission control for contribution work.
//!
//! A sequential checkpoint chain evaluated fresh on every request. Nothing
//! here caches a grant: every background task loop re-checks before
//! continuing, so a mid-task revocation takes effect at the next check.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use std::time::Duration;
use tether_core::{ContributionSettings, DenialReason, PermissionDecision, ResourceSnapshot};

/// Evaluates contribution settings against the latest resource snapshot.
///
/// Pure given its inputs: the same `(settings, snapshot, now)` always
/// produces the same decision.
#[derive(Debug, Clone)]
pub struct PermissionEngine {
    /// Ceiling on one grant's session duration.
    max_grant_duration: Duration,
    /// Retry hint after a user-activity denial.
    activity_retry_seconds: u64,
    /// Fixed cooldown after a headroom denial.
    headroom_retry_seconds: u64,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self {
            max_grant_duration: Duration::from_secs(30 * 60),
            activity_retry_seconds: 60,
            headroom_retry_seconds: 300,
        }
    }
}

impl PermissionEngine {
    pub fn new(max_grant_duration: Duration) -> Self {
        Self {
            max_grant_duration,
            ..Self::default()
        }
    }

    /// Run the checkpoint chain. Checkpoints short-circuit in a fixed
    /// order; the first failure decides the denial and its retry hint.
    pub fn evaluate(
        &self,
        settings: &ContributionSettings,
        snapshot: &ResourceSnapshot,
        now: DateTime<Utc>,
    ) -> PermissionDecision {
        // 1. Master switch.
        if !settings.enabled {
            return PermissionDecision::denied(DenialReason::ContributionDisabled);
        }

        // 2. Explicit terms acknowledgement.
        if settings.terms_acknowledged_at.is_none() {
            return PermissionDecision::denied(DenialReason::TermsNotAccepted);
        }

        // 3. User activity.
        if settings.stop_on_user_activity && !snapshot.is_idle() {
            return PermissionDecision::denied_retry_after(
                DenialReason::UserActivity,
                self.activity_retry_seconds,
            );
        }

        // 4. Idle duration.
        if settings.require_system_idle
            && snapshot.idle_seconds < settings.idle_before_contribution_seconds
        {
            let required = settings.idle_before_contribution_seconds;
            return PermissionDecision::denied_retry_after(
                DenialReason::InsufficientIdleTime {
                    current_seconds: snapshot.idle_seconds,
                    required_seconds: required,
                },
                required - snapshot.idle_seconds,
            );
        }

        // 5. External power.
        if settings.require_external_power && snapshot.on_battery {
            return PermissionDecision::denied(DenialReason::OnBatteryPower);
        }

        // 6. Battery floor, when the platform reports a battery at all.
        if let Some(battery) = snapshot.battery_percent {
            if battery < settings.min_battery_percent {
                return PermissionDecision::denied(DenialReason::BatteryBelowMinimum {
                    current_percent: battery,
                    required_percent: settings.min_battery_percent,
                });
            }
        }

        // 7. Time window and weekday allow-list.
        if !settings.weekday_allowed(now.weekday()) || !settings.hour_allowed(now.hour() as u8) {
            return match seconds_until_next_window(settings, now) {
                Some(seconds) => PermissionDecision::denied_retry_after(
                    DenialReason::OutsideAllowedWindow,
                    seconds,
                ),
                None => PermissionDecision::denied(DenialReason::OutsideAllowedWindow),
            };
        }

        // 8. Resource headroom.
        let available_cpu = (100.0 - snapshot.cpu_usage_percent).max(0.0);
        let max_cpu_percent = settings.max_cpu_percent.min(available_cpu);
        let max_ram_mb = settings.max_ram_mb.min(snapshot.ram_available_mb());
        if max_cpu_percent < 1.0 || max_ram_mb == 0 {
            return PermissionDecision::denied_retry_after(
                DenialReason::NoResourceHeadroom,
                self.headroom_retry_seconds,
            );
        }

        PermissionDecision::Granted {
            max_cpu_percent,
            max_ram_mb,
            max_duration_seconds: self.max_grant_duration.as_secs(),
            allowed_categories: settings.allowed_categories.clone(),
        }
    }
}

/// Seconds until the start of the next hour inside the configured window,
/// scanning at most a week ahead.
fn seconds_until_next_window(
    settings: &ContributionSettings,
    now: DateTime<Utc>,
) -> Option<u64> {
    for offset_hours in 1..=(7 * 24) {
        let candidate = now + ChronoDuration::hours(offset_hours);
        let hour_start = candidate
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))?;
        if settings.weekday_allowed(hour_start.weekday())
            && settings.hour_allowed(hour_start.hour() as u8)
        {
            let seconds = (hour_start - now).num_seconds();
            return u64::try_from(seconds).ok();
        }
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};
    use tether_core::{IdleDepth, TaskCategory};

    fn idle_snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            taken_at: Utc::now(),
            cpu_usage_percent: 4.0,
            ram_usage_percent: 40.0,
            ram_used_mb: 3200,
            ram_total_mb: 8000,
            battery_percent: Some(80.0),
            on_battery: false,
            idle_seconds: 900,
            idle_depth: IdleDepth::Deep,
            stale: false,
        }
    }

    fn permissive_settings() -> ContributionSettings {
        ContributionSettings::builder()
            .enable_with_acknowledgement(Utc::now())
            .max_cpu_percent(25.0)
            .max_ram_mb(512)
            .idle_before_contribution_seconds(300)
            .min_battery_percent(50.0)
            .allowed_categories(vec![TaskCategory::EmbeddingGeneration])
            .build()
            .unwrap()
    }

    #[test]
    fn test_disabled_master_switch_denies_first() {
        let engine = PermissionEngine::default();
        // Even with every other condition hostile, the master switch wins.
        let mut snapshot = idle_snapshot();
        snapshot.idle_depth = IdleDepth::Active;
        snapshot.on_battery = true;
        let decision =
            engine.evaluate(&ContributionSettings::default(), &snapshot, Utc::now());
        assert_eq!(
            decision,
            PermissionDecision::denied(DenialReason::ContributionDisabled)
        );
    }

    #[test]
    fn test_user_activity_denies_with_grace_retry() {
        let engine = PermissionEngine::default();
        let mut snapshot = idle_snapshot();
        snapshot.idle_depth = IdleDepth::Active;
        let decision = engine.evaluate(&permissive_settings(), &snapshot, Utc::now());
        assert_eq!(
            decision,
            PermissionDecision::denied_retry_after(DenialReason::UserActivity, 60)
        );
    }

    #[test]
    fn test_insufficient_idle_reports_deficit() {
        let engine = PermissionEngine::default();
        let mut snapshot = idle_snapshot();
        snapshot.idle_seconds = 120;
        let decision = engine.evaluate(&permissive_settings(), &snapshot, Utc::now());
        assert_eq!(
            decision,
            PermissionDecision::denied_retry_after(
                DenialReason::InsufficientIdleTime {
                    current_seconds: 120,
                    required_seconds: 300,
                },
                180,
            )
        );
    }

    #[test]
    fn test_battery_constraints() {
        let engine = PermissionEngine::default();

        let mut snapshot = idle_snapshot();
        snapshot.on_battery = true;
        let decision = engine.evaluate(&permissive_settings(), &snapshot, Utc::now());
        assert_eq!(
            decision,
            PermissionDecision::denied(DenialReason::OnBatteryPower)
        );

        let mut settings = permissive_settings();
        settings.require_external_power = false;
        let mut snapshot = idle_snapshot();
        snapshot.on_battery = true;
        snapshot.battery_percent = Some(30.0);
        let decision = engine.evaluate(&settings, &snapshot, Utc::now());
        assert_eq!(
            decision,
            PermissionDecision::denied(DenialReason::BatteryBelowMinimum {
                current_percent: 30.0,
                required_percent: 50.0,
            })
        );
    }

    #[test]
    fn test_window_denial_hints_next_eligible_hour() {
        let engine = PermissionEngine::default();
        let mut settings = permissive_settings();
        settings.allowed_hours = Some((22, 6));
        // A Wednesday at 12:30 UTC.
        let now = Utc.with_ymd_and_hms(2025, 6, 11, 12, 30, 0).unwrap();
        let decision = engine.evaluate(&settings, &idle_snapshot(), now);
        match decision {
            PermissionDecision::Denied {
                reason: DenialReason::OutsideAllowedWindow,
                retry_after_seconds: Some(seconds),
            } => {
                // Next window opens at 22:00, 9.5 hours away.
                assert_eq!(seconds, 9 * 3600 + 1800);
            }
            other => panic!("expected window denial, got {other:?}"),
        }
    }

    #[test]
    fn test_weekday_allow_list_is_enforced() {
        let engine = PermissionEngine::default();
        let mut settings = permissive_settings();
        settings.allowed_weekdays = vec![Weekday::Sat, Weekday::Sun];
        // A Wednesday.
        let now = Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap();
        let decision = engine.evaluate(&settings, &idle_snapshot(), now);
        assert!(matches!(
            decision,
            PermissionDecision::Denied {
                reason: DenialReason::OutsideAllowedWindow,
                retry_after_seconds: Some(_),
            }
        ));
    }

    #[test]
    fn test_no_headroom_denies_with_cooldown() {
        let engine = PermissionEngine::default();
        let mut snapshot = idle_snapshot();
        snapshot.cpu_usage_percent = 99.5;
        // Trailing average kept the depth out of Active despite the spike.
        snapshot.idle_depth = IdleDepth::Light;
        let decision = engine.evaluate(&permissive_settings(), &snapshot, Utc::now());
        assert_eq!(
            decision,
            PermissionDecision::denied_retry_after(DenialReason::NoResourceHeadroom, 300)
        );
    }

    #[test]
    fn test_grant_ceilings_are_clamped_to_headroom() {
        let engine = PermissionEngine::default();
        let mut settings = permissive_settings();
        settings.max_cpu_percent = 80.0;
        settings.max_ram_mb = 100_000;
        let mut snapshot = idle_snapshot();
        snapshot.cpu_usage_percent = 70.0;
        snapshot.idle_depth = IdleDepth::Light;

        match engine.evaluate(&settings, &snapshot, Utc::now()) {
            PermissionDecision::Granted {
                max_cpu_percent,
                max_ram_mb,
                max_duration_seconds,
                allowed_categories,
            } => {
                // min(configured 80, available 30)
                assert_eq!(max_cpu_percent, 30.0);
                // min(configured 100000, available 4800)
                assert_eq!(max_ram_mb, 4800);
                assert_eq!(max_duration_seconds, 30 * 60);
                assert_eq!(allowed_categories, vec![TaskCategory::EmbeddingGeneration]);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn test_decision_is_pure() {
        let engine = PermissionEngine::default();
        let settings = permissive_settings();
        let snapshot = idle_snapshot();
        let now = Utc.with_ymd_and_hms(2025, 6, 11, 3, 0, 0).unwrap();
        let first = engine.evaluate(&settings, &snapshot, now);
        let second = engine.evaluate(&settings, &snapshot, now);
        assert_eq!(first, second);
        assert!(first.is_granted());
    }
}
