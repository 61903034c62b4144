//! The contribution scheduler.
//!
//! Admits at most one contribution task per device. Every tick re-queries
//! the permission engine against the latest snapshot; a denial while a task
//! is running aborts it immediately - user-activity revocation must take
//! effect within one tick, not at the task's convenience.

use crate::permission::PermissionEngine;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    new_task_id, ContributionTask, PermissionDecision, ResourceSnapshot, SettingsHandle,
    TaskCategory, TaskOutcome, TaskReport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Abort latency is bounded by this interval.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
        }
    }
}

// ============================================================================
// TASK EXECUTION SEAM
// ============================================================================

/// Executes the body of an admitted task.
///
/// Implementations update the shared task value (progress, cpu seconds,
/// peak ram) as they go, so an abort still reports the usage accumulated up
/// to that point.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Arc<tokio::sync::Mutex<ContributionTask>>) -> Result<(), String>;
}

struct RunningTask {
    task: Arc<tokio::sync::Mutex<ContributionTask>>,
    handle: JoinHandle<Result<(), String>>,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// One-at-a-time admission of background work, always subordinate to local
/// user priority.
pub struct ContributionScheduler {
    config: SchedulerConfig,
    engine: PermissionEngine,
    settings: SettingsHandle,
    snapshot_rx: watch::Receiver<ResourceSnapshot>,
    runner: Arc<dyn TaskRunner>,
    reports_tx: mpsc::Sender<TaskReport>,
    backlog: Mutex<VecDeque<TaskCategory>>,
}

impl ContributionScheduler {
    pub fn new(
        config: SchedulerConfig,
        engine: PermissionEngine,
        settings: SettingsHandle,
        snapshot_rx: watch::Receiver<ResourceSnapshot>,
        runner: Arc<dyn TaskRunner>,
        reports_tx: mpsc::Sender<TaskReport>,
    ) -> Self {
        Self {
            config,
            engine,
            settings,
            snapshot_rx,
            runner,
            reports_tx,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a unit of background work offered by the service. It runs only
    /// when a grant admits its category.
    pub fn submit_work(&self, category: TaskCategory) {
        self.backlog_guard().push_back(category);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog_guard().len()
    }

    fn backlog_guard(&self) -> std::sync::MutexGuard<'_, VecDeque<TaskCategory>> {
        self.backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// First queued work item whose category the grant allows.
    fn next_admissible(&self, allowed: &[TaskCategory]) -> Option<TaskCategory> {
        let mut backlog = self.backlog_guard();
        let position = backlog.iter().position(|category| allowed.contains(category))?;
        backlog.remove(position)
    }

    async fn report(&self, task: ContributionTask, outcome: TaskOutcome) {
        let report = TaskReport {
            task,
            outcome,
            finished_at: Utc::now(),
        };
        if self.reports_tx.send(report).await.is_err() {
            tracing::debug!("Task report receiver dropped");
        }
    }

    /// One scheduler tick. Takes and returns the running-task slot.
    async fn on_tick(&self, running: Option<RunningTask>) -> Option<RunningTask> {
        let snapshot = self.snapshot_rx.borrow().clone();
        let settings = self.settings.current();
        let decision = self.engine.evaluate(&settings, &snapshot, Utc::now());

        match decision {
            PermissionDecision::Denied {
                reason,
                retry_after_seconds,
            } => {
                if let Some(running) = running {
                    // Immediate abort, not a graceful drain.
                    running.handle.abort();
                    let task = running.task.lock().await.clone();
                    tracing::warn!(
                        task_id = %task.task_id,
                        reason = %reason,
                        "Aborting contribution task"
                    );
                    self.report(
                        task,
                        TaskOutcome::Aborted {
                            reason: reason.to_string(),
                        },
                    )
                    .await;
                } else {
                    tracing::debug!(
                        reason = %reason,
                        retry_after_seconds,
                        "Contribution denied"
                    );
                }
                None
            }

            PermissionDecision::Granted {
                max_cpu_percent,
                max_ram_mb,
                max_duration_seconds,
                allowed_categories,
            } => {
                if let Some(running) = running {
                    return self
                        .supervise_running(running, max_duration_seconds)
                        .await;
                }

                let Some(category) = self.next_admissible(&allowed_categories) else {
                    return None;
                };
                let task = ContributionTask::new(
                    new_task_id(),
                    category,
                    max_cpu_percent,
                    max_ram_mb,
                    Utc::now(),
                );
                tracing::info!(
                    task_id = %task.task_id,
                    category = %category,
                    max_cpu_percent,
                    max_ram_mb,
                    "Admitted contribution task"
                );
                let shared = Arc::new(tokio::sync::Mutex::new(task));
                let handle = tokio::spawn({
                    let runner = self.runner.clone();
                    let shared = shared.clone();
                    async move { runner.run(shared).await }
                });
                Some(RunningTask {
                    task: shared,
                    handle,
                })
            }
        }
    }

    /// Collect a finished task, or abort one that outlived its grant.
    async fn supervise_running(
        &self,
        running: RunningTask,
        max_duration_seconds: u64,
    ) -> Option<RunningTask> {
        if running.handle.is_finished() {
            let task = running.task.lock().await.clone();
            let outcome = match running.handle.await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(reason)) => TaskOutcome::Failed { reason },
                Err(join_err) => TaskOutcome::Failed {
                    reason: join_err.to_string(),
                },
            };
            tracing::info!(task_id = %task.task_id, outcome = ?outcome, "Contribution task finished");
            self.report(task, outcome).await;
            return None;
        }

        let task = running.task.lock().await.clone();
        let elapsed = (Utc::now() - task.started_at).num_seconds().max(0) as u64;
        if elapsed > max_duration_seconds {
            running.handle.abort();
            tracing::warn!(
                task_id = %task.task_id,
                elapsed_seconds = elapsed,
                "Contribution task exceeded its grant duration"
            );
            self.report(
                task,
                TaskOutcome::Aborted {
                    reason: "grant duration exceeded".to_string(),
                },
            )
            .await;
            return None;
        }

        Some(running)
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Tick loop. Runs until the shutdown signal flips true; a task still
/// running at shutdown is aborted and reported.
pub async fn scheduler_task(
    scheduler: Arc<ContributionScheduler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(scheduler.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        tick_ms = scheduler.config.tick_interval.as_millis() as u64,
        "Contribution scheduler started"
    );

    let mut running: Option<RunningTask> = None;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    if let Some(active) = running.take() {
                        active.handle.abort();
                        let task = active.task.lock().await.clone();
                        scheduler
                            .report(
                                task,
                                TaskOutcome::Aborted {
                                    reason: "scheduler shutting down".to_string(),
                                },
                            )
                            .await;
                    }
                    tracing::info!("Contribution scheduler shutting down");
                    break;
                }
            }
            _ = tick.tick() => {
                running = scheduler.on_tick(running.take()).await;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
