//! Recurring fetch, backup and cleanup jobs
//!
//! Each job runs in its own task on a fixed interval. A job that fails only
//! logs; the next tick runs it again. Shutdown cancels the loops without
//! waiting for a job that is already running.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::shared_state::AppState;
use crate::workers::BackupOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub fetch: Duration,
    pub backup: Duration,
    pub cleanup: Duration,
}

impl SchedulerIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch: config.fetch_interval(),
            backup: config.backup_interval(),
            cleanup: config.cleanup_interval(),
        }
    }
}

pub struct Scheduler {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Run the startup fetch (and a first backup if none ever succeeded),
    /// then start the recurring jobs with the configured intervals.
    pub async fn start(state: AppState) -> Self {
        let intervals = SchedulerIntervals::from_config(&state.config);
        Self::start_with(state, intervals).await
    }

    pub async fn start_with(state: AppState, intervals: SchedulerIntervals) -> Self {
        info!("Running initial fetch...");
        fetch_job(&state).await;

        let store = state.store.clone();
        match tokio::task::spawn_blocking(move || store.statistics()).await {
            Ok(Ok(stats)) if stats.last_backup.at.is_none() => {
                info!("No previous backup found, creating initial backup...");
                backup_job(&state).await;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Could not read backup history: {}", e),
            Err(e) => warn!("Backup history task failed: {}", e),
        }

        Self::spawn_jobs(state, intervals)
    }

    fn spawn_jobs(state: AppState, intervals: SchedulerIntervals) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        let fetch_state = state.clone();
        tasks.push(tokio::spawn(run_every(
            "fetch",
            intervals.fetch,
            shutdown.clone(),
            move || {
                let state = fetch_state.clone();
                async move { fetch_job(&state).await }
            },
        )));

        let backup_state = state.clone();
        tasks.push(tokio::spawn(run_every(
            "backup",
            intervals.backup,
            shutdown.clone(),
            move || {
                let state = backup_state.clone();
                async move { backup_job(&state).await }
            },
        )));

        tasks.push(tokio::spawn(run_every(
            "cleanup",
            intervals.cleanup,
            shutdown.clone(),
            move || {
                let state = state.clone();
                async move { cleanup_job(&state).await }
            },
        )));

        info!(
            "Scheduler started: fetch every {:?}, backup every {:?}, cleanup every {:?}",
            intervals.fetch, intervals.backup, intervals.cleanup
        );
        Self { shutdown, tasks }
    }

    /// Stop all loops. Returns immediately; in-flight jobs are not awaited.
    pub fn shutdown(&self) {
        info!("Stopping scheduler");
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.tasks.iter().any(|task| !task.is_finished())
    }
}

async fn run_every<F, Fut>(name: &'static str, period: Duration, shutdown: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; startup work is handled separately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Scheduled {} job stopped", name);
                break;
            }
            _ = ticker.tick() => job().await,
        }
    }
}

async fn fetch_job(state: &AppState) {
    let result = state.pipeline.run_fetch_cycle().await;
    if result.success {
        info!(
            "Scheduled fetch: {} fetched, {} new",
            result.events_fetched, result.events_new
        );
    } else {
        warn!(
            "Scheduled fetch failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

async fn backup_job(state: &AppState) {
    let backups = state.backups.clone();
    match tokio::task::spawn_blocking(move || backups.create_backup()).await {
        Ok(BackupOutcome::Success(success)) => info!("Scheduled backup: {}", success.filename),
        Ok(BackupOutcome::Failure(failure)) => error!("Scheduled backup failed: {}", failure.error),
        Err(e) => error!("Backup task failed: {}", e),
    }
}

async fn cleanup_job(state: &AppState) {
    let store = state.store.clone();
    let backups = state.backups.clone();
    let fetch_log_days = state.config.fetch_log_retention_days;
    let backup_days = state.config.backup_retention_days;

    let joined = tokio::task::spawn_blocking(move || {
        match store.prune_fetch_logs(fetch_log_days) {
            Ok(deleted) => info!("Cleanup: removed {} fetch log entries", deleted),
            Err(e) => error!("Cleanup: pruning fetch log failed: {}", e),
        }
        match backups.prune_old_backups(backup_days) {
            Ok(deleted) => info!("Cleanup: removed {} old backups", deleted),
            Err(e) => error!("Cleanup: pruning backups failed: {}", e),
        }
        if let Err(e) = store.incremental_vacuum(None) {
            error!("Cleanup: incremental vacuum failed: {}", e);
        }
    })
    .await;
    if let Err(e) = joined {
        error!("Cleanup task failed: {}", e);
    }
}
