//! TETHER daemon entry point.
//!
//! Loads configuration, wires the shared context, and runs the three
//! background loops (resource sampling, sync cycling, contribution ticking)
//! until ctrl-c.

mod config;

use async_trait::async_trait;
use chrono::Utc;
use config::DaemonConfig;
use std::sync::Arc;
use std::time::Duration;
use tether_contrib::{
    sampler_task, scheduler_task, ContributionScheduler, PermissionEngine, ResourceAnalyzer,
    SchedulerConfig, SysinfoProbe, TaskRunner,
};
use tether_core::{
    ContributionTask, IdleDepth, ResourceSnapshot, SettingsHandle, TaskReport,
};
use tether_realtime::{ChannelConfig, RealtimeChannel};
use tether_sync::{
    realtime_pump_task, sync_task, ConflictResolver, HttpTransport, InMemoryItemStore,
    PendingQueue, SyncManager,
};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Stand-in for the inference host integration: the actual model execution
/// (embedding, transcription, OCR) lives in a separate component that plugs
/// in through [`TaskRunner`].
struct NoopRunner;

#[async_trait]
impl TaskRunner for NoopRunner {
    async fn run(&self, task: Arc<tokio::sync::Mutex<ContributionTask>>) -> Result<(), String> {
        let mut task = task.lock().await;
        task.progress = 1.0;
        Ok(())
    }
}

/// Conservative placeholder until the first real sample lands.
fn startup_snapshot() -> ResourceSnapshot {
    ResourceSnapshot {
        taken_at: Utc::now(),
        cpu_usage_percent: 0.0,
        ram_usage_percent: 0.0,
        ram_used_mb: 0,
        ram_total_mb: 0,
        battery_percent: None,
        on_battery: false,
        idle_seconds: 0,
        idle_depth: IdleDepth::Active,
        stale: true,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::load()?;
    let sync_config = config.sync_config();
    sync_config.validate()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Sync context: one exclusive primitive per logical resource.
    let queue = Arc::new(PendingQueue::new(sync_config.max_item_attempts));
    let store = Arc::new(InMemoryItemStore::new());
    let transport = Arc::new(HttpTransport::new(
        &config.remote.base_url,
        &config.remote.auth_token,
        config.remote.device_id,
        sync_config.request_timeout,
    )?);

    let mut manager = SyncManager::new(
        sync_config.clone(),
        queue,
        store,
        transport,
        ConflictResolver::new(),
    );

    let (events_tx, events_rx) = mpsc::channel(64);
    if sync_config.realtime_enabled {
        if let Some(ws_endpoint) = &config.remote.ws_endpoint {
            let channel = RealtimeChannel::spawn(
                ChannelConfig {
                    url: ws_endpoint.clone(),
                    auth_token: config.remote.auth_token.clone(),
                    device_id: config.remote.device_id,
                    heartbeat_interval: sync_config.heartbeat_interval,
                    ack_timeout: sync_config.ack_timeout,
                    max_missed_heartbeats: sync_config.max_missed_heartbeats,
                    retry: sync_config.retry.clone(),
                },
                events_tx,
                shutdown_rx.clone(),
            );
            manager = manager.with_realtime(channel);
        }
    }
    let manager = Arc::new(manager);

    // Contribution context.
    let settings = SettingsHandle::default();
    let (snapshot_tx, snapshot_rx) = watch::channel(startup_snapshot());
    let analyzer = ResourceAnalyzer::new(Box::new(SysinfoProbe::new()));

    let (reports_tx, reports_rx) = mpsc::channel(16);
    let scheduler = Arc::new(ContributionScheduler::new(
        SchedulerConfig {
            tick_interval: Duration::from_secs(config.contribution.tick_interval_secs),
        },
        PermissionEngine::new(sync_config.max_grant_duration),
        settings.clone(),
        snapshot_rx,
        Arc::new(NoopRunner),
        reports_tx,
    ));

    let sampler = tokio::spawn(sampler_task(
        analyzer,
        Duration::from_secs(config.contribution.sample_interval_secs),
        snapshot_tx,
        shutdown_rx.clone(),
    ));
    let syncer = tokio::spawn(sync_task(manager.clone(), shutdown_rx.clone()));
    let pump = tokio::spawn(realtime_pump_task(
        manager.clone(),
        events_rx,
        shutdown_rx.clone(),
    ));
    let contributor = tokio::spawn(scheduler_task(scheduler, shutdown_rx.clone()));
    let reporter = tokio::spawn(report_task(reports_rx, shutdown_rx));

    tracing::info!(device_id = %config.remote.device_id, "TETHER daemon running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(sampler, syncer, pump, contributor, reporter);
    Ok(())
}

/// Log finished contribution tasks with their accumulated usage, for
/// transparency.
async fn report_task(
    mut reports_rx: mpsc::Receiver<TaskReport>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            report = reports_rx.recv() => {
                match report {
                    Some(report) => {
                        tracing::info!(
                            task_id = %report.task.task_id,
                            category = %report.task.category,
                            outcome = ?report.outcome,
                            cpu_seconds = report.task.cpu_seconds,
                            peak_ram_mb = report.task.peak_ram_mb,
                            "Contribution task report"
                        );
                    }
                    None => break,
                }
            }
        }
    }
}
