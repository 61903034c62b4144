//! TETHER Contrib - Idle Capacity Contribution
//!
//! Lets a device donate idle capacity to background work, but only under
//! strict, user-controlled, instantly-revocable conditions:
//!
//! - the [`ResourceAnalyzer`] samples load into a rolling window and
//!   classifies idle depth from the trailing average
//! - the [`PermissionEngine`] runs a fixed checkpoint chain on every
//!   admission request, never caching a grant
//! - the [`ContributionScheduler`] runs at most one task, re-checks
//!   permission every tick, and aborts immediately on any denial
//!
//! Denials are ordinary outcomes with human-readable reasons, so the user
//! always understands why no background work is occurring.

pub mod analyzer;
pub mod permission;
pub mod probe;
pub mod scheduler;

pub use analyzer::{classify_idle_depth, sampler_task, ResourceAnalyzer, DEFAULT_WINDOW_CAPACITY};
pub use permission::PermissionEngine;
pub use probe::{ProbeReading, ScriptedProbe, SysinfoProbe, SystemProbe};
pub use scheduler::{scheduler_task, ContributionScheduler, SchedulerConfig, TaskRunner};
