//! Rolling-window resource analysis.
//!
//! Samples system load at a fixed interval into a fixed-capacity window,
//! classifies idle depth from the trailing average (never the instantaneous
//! value, to avoid flapping on transient spikes), and produces advisory
//! short-horizon forecasts.

use crate::probe::SystemProbe;
use std::collections::VecDeque;
use tether_core::{IdleDepth, ResourceForecast, ResourceSnapshot, Timestamp};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Window capacity: the last 60 samples at the sampling interval.
pub const DEFAULT_WINDOW_CAPACITY: usize = 60;

/// The fixed ceiling forecasts extrapolate against.
const SYSTEM_CPU_CEILING: f32 = 100.0;

/// Idle depth from trailing-average CPU. Lower average load classifies as
/// deeper idle; the boundaries are half-open so ties land on the shallower
/// side.
pub fn classify_idle_depth(trailing_avg_cpu: f32) -> IdleDepth {
    if trailing_avg_cpu > 30.0 {
        IdleDepth::Active
    } else if trailing_avg_cpu > 20.0 {
        IdleDepth::Light
    } else if trailing_avg_cpu > 10.0 {
        IdleDepth::Medium
    } else if trailing_avg_cpu > 5.0 {
        IdleDepth::Deep
    } else {
        IdleDepth::SleepReady
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

/// Fixed-capacity ring of [`ResourceSnapshot`]s plus the probe that feeds
/// it. No external I/O failure can corrupt historical samples: a failed
/// read produces a stale carry-forward snapshot instead.
pub struct ResourceAnalyzer {
    probe: Box<dyn SystemProbe>,
    window: VecDeque<ResourceSnapshot>,
    capacity: usize,
}

impl ResourceAnalyzer {
    pub fn new(probe: Box<dyn SystemProbe>) -> Self {
        Self::with_capacity(probe, DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(probe: Box<dyn SystemProbe>, capacity: usize) -> Self {
        Self {
            probe,
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Take one measurement, classify it, and append it to the window,
    /// evicting the oldest sample when the window is full. There is no
    /// error path.
    pub fn sample(&mut self, now: Timestamp) -> ResourceSnapshot {
        let snapshot = match self.probe.read() {
            Some(reading) => {
                let avg = self.trailing_average_with(reading.cpu_usage_percent);
                let ram_usage_percent = if reading.ram_total_mb > 0 {
                    (reading.ram_used_mb as f32 / reading.ram_total_mb as f32) * 100.0
                } else {
                    0.0
                };
                ResourceSnapshot {
                    taken_at: now,
                    cpu_usage_percent: reading.cpu_usage_percent,
                    ram_usage_percent,
                    ram_used_mb: reading.ram_used_mb,
                    ram_total_mb: reading.ram_total_mb,
                    battery_percent: reading.battery_percent,
                    on_battery: reading.on_battery,
                    idle_seconds: reading.idle_seconds,
                    idle_depth: classify_idle_depth(avg),
                    stale: false,
                }
            }
            // Failed OS read: carry the previous values forward, flagged.
            None => match self.window.back() {
                Some(previous) => ResourceSnapshot {
                    taken_at: now,
                    stale: true,
                    ..previous.clone()
                },
                None => ResourceSnapshot {
                    taken_at: now,
                    cpu_usage_percent: 0.0,
                    ram_usage_percent: 0.0,
                    ram_used_mb: 0,
                    ram_total_mb: 0,
                    battery_percent: None,
                    on_battery: false,
                    idle_seconds: 0,
                    idle_depth: IdleDepth::Active,
                    stale: true,
                },
            },
        };

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<&ResourceSnapshot> {
        self.window.back()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Trailing-average CPU over the window.
    pub fn trailing_average_cpu(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.window.iter().map(|s| s.cpu_usage_percent).sum();
        sum / self.window.len() as f32
    }

    fn trailing_average_with(&self, next_cpu: f32) -> f32 {
        let sum: f32 = self.window.iter().map(|s| s.cpu_usage_percent).sum();
        (sum + next_cpu) / (self.window.len() + 1) as f32
    }

    /// Linear extrapolation of the window trend against the fixed system
    /// ceiling. Advisory only - never a hard admission gate.
    pub fn forecast(&self) -> Option<ResourceForecast> {
        if self.window.len() < 2 {
            return None;
        }
        let first = self.window.front()?;
        let last = self.window.back()?;
        let span = (self.window.len() - 1) as f32;
        let horizon = self.window.len() as f32 / 2.0;

        let cpu_slope = (last.cpu_usage_percent - first.cpu_usage_percent) / span;
        let projected_cpu = (self.trailing_average_cpu() + cpu_slope * horizon)
            .clamp(0.0, SYSTEM_CPU_CEILING);

        let ram_slope = (last.ram_used_mb as f32 - first.ram_used_mb as f32) / span;
        let avg_ram: f32 =
            self.window.iter().map(|s| s.ram_used_mb as f32).sum::<f32>() / self.window.len() as f32;
        let projected_ram_used = (avg_ram + ram_slope * horizon).max(0.0) as u64;

        Some(ResourceForecast {
            predicted_cpu_available_percent: SYSTEM_CPU_CEILING - projected_cpu,
            predicted_ram_available_mb: last.ram_total_mb.saturating_sub(projected_ram_used),
        })
    }
}

// ============================================================================
// SAMPLER TASK
// ============================================================================

/// Background sampling loop. Publishes each snapshot through `snapshot_tx`
/// so the permission check always reads the latest measurement without
/// touching the analyzer lock.
pub async fn sampler_task(
    mut analyzer: ResourceAnalyzer,
    sample_interval: Duration,
    snapshot_tx: watch::Sender<ResourceSnapshot>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(sample_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = sample_interval.as_millis() as u64,
        "Resource sampler started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Resource sampler shutting down");
                    break;
                }
            }
            _ = tick.tick() => {
                let snapshot = analyzer.sample(chrono::Utc::now());
                if let Some(forecast) = analyzer.forecast() {
                    tracing::trace!(
                        cpu_available = forecast.predicted_cpu_available_percent,
                        ram_available_mb = forecast.predicted_ram_available_mb,
                        "Resource forecast"
                    );
                }
                snapshot_tx.send_replace(snapshot);
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
