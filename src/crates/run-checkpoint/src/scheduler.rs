//! Auto-checkpoint scheduler
//!
//! Each enabled run gets a background task that sleeps for the configured interval and then
//! tries to create an `auto` checkpoint. A tick never waits for the run lock: if a manual
//! checkpoint or a restore holds it, the tick is skipped and the next one tries again.
//!
//! The task listens on a `watch` channel for configuration changes. A new interval re-arms
//! the timer from the moment of the change; disabling ends the task without touching a
//! creation that is already running.

use crate::{
    checkpoint::{Checkpoint, CheckpointRequest, CheckpointType, RunId},
    error::{CheckpointError, Result},
    ledger::CheckpointLedger,
    traits::RunExecutor,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-run auto-checkpoint settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoCheckpointConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl AutoCheckpointConfig {
    pub const MIN_INTERVAL_SECS: u64 = 60;
    pub const MAX_INTERVAL_SECS: u64 = 3600;

    /// Build a validated config. The interval must lie in [60, 3600] seconds.
    pub fn new(enabled: bool, interval_seconds: u64) -> Result<Self> {
        Self::validate_interval(interval_seconds)?;
        Ok(Self {
            enabled,
            interval_seconds,
        })
    }

    pub fn validate_interval(interval_seconds: u64) -> Result<()> {
        if !(Self::MIN_INTERVAL_SECS..=Self::MAX_INTERVAL_SECS).contains(&interval_seconds) {
            return Err(CheckpointError::Validation(format!(
                "auto-checkpoint interval must be between {} and {} seconds, got {}",
                Self::MIN_INTERVAL_SECS,
                Self::MAX_INTERVAL_SECS,
                interval_seconds
            )));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// What a single tick did
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Created(Checkpoint),
    /// The run lock was held by another operation
    Skipped,
    /// Reading the run or writing the checkpoint failed; logged, not surfaced
    Failed(String),
}

struct Schedule {
    config: watch::Sender<AutoCheckpointConfig>,
    task: JoinHandle<()>,
}

/// Periodic `auto` checkpoint creation, one timer per run
#[derive(Clone)]
pub struct AutoCheckpointScheduler {
    ledger: CheckpointLedger,
    executor: Arc<dyn RunExecutor>,
    schedules: Arc<DashMap<RunId, Schedule>>,
}

impl std::fmt::Debug for AutoCheckpointScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCheckpointScheduler")
            .field("active_runs", &self.schedules.len())
            .finish_non_exhaustive()
    }
}

impl AutoCheckpointScheduler {
    pub fn new(ledger: CheckpointLedger, executor: Arc<dyn RunExecutor>) -> Self {
        Self {
            ledger,
            executor,
            schedules: Arc::new(DashMap::new()),
        }
    }

    /// Enable, re-arm or disable auto checkpoints for a run.
    ///
    /// Must be called from within a Tokio runtime. Returns the config now in effect.
    pub fn configure(
        &self,
        run_id: &RunId,
        enabled: bool,
        interval_seconds: u64,
    ) -> Result<AutoCheckpointConfig> {
        let config = AutoCheckpointConfig::new(enabled, interval_seconds)?;

        if !enabled {
            if let Some((_, schedule)) = self.schedules.remove(run_id) {
                schedule.config.send_replace(config);
                info!(run_id = %run_id, "Auto-checkpoint disabled");
            }
            return Ok(config);
        }

        if let Some(schedule) = self.schedules.get(run_id) {
            let changed = schedule.config.send_if_modified(|current| {
                if *current == config {
                    false
                } else {
                    *current = config;
                    true
                }
            });
            if changed {
                info!(run_id = %run_id, interval_seconds, "Auto-checkpoint re-armed");
            }
            return Ok(config);
        }

        let (tx, rx) = watch::channel(config);
        let task = tokio::spawn(run_schedule(self.clone(), run_id.clone(), rx));
        self.schedules.insert(
            run_id.clone(),
            Schedule {
                config: tx,
                task,
            },
        );
        info!(run_id = %run_id, interval_seconds, "Auto-checkpoint enabled");
        Ok(config)
    }

    /// Current config of a run, `None` when auto checkpoints are off
    pub fn config(&self, run_id: &RunId) -> Option<AutoCheckpointConfig> {
        self.schedules.get(run_id).map(|s| *s.config.borrow())
    }

    /// Runs with auto checkpoints enabled
    pub fn active_runs(&self) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self.schedules.iter().map(|e| e.key().clone()).collect();
        runs.sort();
        runs
    }

    /// Try to create one auto checkpoint for the run right now.
    ///
    /// The run lock is taken before the run is read, so the captured state cannot be
    /// overtaken by a restore between capture and commit.
    pub async fn tick(&self, run_id: &RunId) -> TickOutcome {
        let guard = match self.ledger.try_lock_run(run_id) {
            Ok(guard) => guard,
            Err(CheckpointError::Concurrency { .. }) => {
                debug!(run_id = %run_id, "Run busy, skipping auto-checkpoint tick");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not lock run for auto-checkpoint");
                return TickOutcome::Failed(e.to_string());
            }
        };

        let request = match self.build_request(run_id).await {
            Ok(request) => request,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not read run for auto-checkpoint");
                return TickOutcome::Failed(e.to_string());
            }
        };

        match self.ledger.create_locked(&guard, request).await {
            Ok(checkpoint) => TickOutcome::Created(checkpoint),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Auto-checkpoint failed");
                TickOutcome::Failed(e.to_string())
            }
        }
    }

    async fn build_request(&self, run_id: &RunId) -> Result<CheckpointRequest> {
        let info = self.executor.run_info(run_id).await?;
        let state = self.executor.capture_state(run_id).await?;
        Ok(
            CheckpointRequest::new(run_id.clone(), info.current_step, CheckpointType::Auto, state)
                .with_usage(info.usage),
        )
    }

    /// Disable every run and wait for their tasks to finish any in-flight tick.
    pub async fn shutdown(&self) {
        let runs = self.active_runs();
        let mut tasks = Vec::with_capacity(runs.len());
        for run_id in runs {
            if let Some((_, schedule)) = self.schedules.remove(&run_id) {
                schedule.config.send_modify(|c| c.enabled = false);
                tasks.push(schedule.task);
            }
        }
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                warn!(error = %e, "Auto-checkpoint task ended abnormally");
            }
        }
    }
}

async fn run_schedule(
    scheduler: AutoCheckpointScheduler,
    run_id: RunId,
    mut config: watch::Receiver<AutoCheckpointConfig>,
) {
    loop {
        let current = *config.borrow_and_update();
        if !current.enabled {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(current.interval()) => {
                if let TickOutcome::Created(checkpoint) = scheduler.tick(&run_id).await {
                    debug!(run_id = %run_id, version = checkpoint.version, "Auto-checkpoint tick");
                }
            }
            changed = config.changed() => {
                // sender gone: the schedule was removed
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(run_id = %run_id, "Auto-checkpoint task stopped");
}
