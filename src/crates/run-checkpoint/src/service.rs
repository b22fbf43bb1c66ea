//! The checkpoint service
//!
//! [`CheckpointService`] is the surface a host application talks to. It wires the ledger,
//! the restore coordinator and the auto-checkpoint scheduler to one set of stores and one
//! run executor.
//!
//! # Example
//!
//! ```rust
//! use run_checkpoint::{
//!     CheckpointService, CheckpointSettings, InMemoryRunExecutor, StorageBackend,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> run_checkpoint::Result<()> {
//! let executor = InMemoryRunExecutor::new();
//! executor.upsert_run("run-1", 10, json!({"a": 1, "b": 2})).await;
//!
//! let mut settings = CheckpointSettings::default();
//! settings.storage.backend = StorageBackend::Memory;
//!
//! let service = CheckpointService::builder(Arc::new(executor.clone()))
//!     .settings(settings)
//!     .build()?;
//!
//! let first = service
//!     .create_manual_checkpoint(
//!         &"run-1".into(),
//!         10,
//!         json!({"a": 1}),
//!         Some("before refactor".into()),
//!     )
//!     .await?;
//! assert_eq!(first.version, 1);
//!
//! // or checkpoint whatever the run holds right now
//! let second = service.capture_checkpoint(&"run-1".into(), None).await?;
//! assert_eq!(second.version, 2);
//!
//! let handle = service.request_restore(&"run-1".into(), 1).await?;
//! let confirmation = handle.affirm();
//! let result = service.confirm_restore(handle, confirmation).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

use crate::{
    checkpoint::{Checkpoint, CheckpointRequest, CheckpointType, RunId, StateBlob, Version},
    config::{CheckpointSettings, StorageBackend},
    diff::{compute_diff, DiffItem, DiffSummary},
    error::Result,
    fs::{FsLedgerStore, FsSnapshotStore},
    ledger::CheckpointLedger,
    memory::{InMemoryLedgerStore, InMemorySnapshotStore},
    restore::{Confirmation, RestoreCoordinator, RestoreHandle, RestoreRecord, RestoreResult},
    scheduler::{AutoCheckpointConfig, AutoCheckpointScheduler},
    traits::{Clock, LedgerStore, RunExecutor, SnapshotStore, SystemClock},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A checkpoint together with its state blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub checkpoint: Checkpoint,
    pub state: StateBlob,
}

/// Structural comparison of two checkpoints, `from` taken as the "before" side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointComparison {
    pub from: Checkpoint,
    pub to: Checkpoint,
    pub summary: DiffSummary,
    pub items: Vec<DiffItem>,
}

/// Checkpoint versioning, comparison, restore and auto checkpoints for agent runs
#[derive(Clone)]
pub struct CheckpointService {
    settings: CheckpointSettings,
    ledger: CheckpointLedger,
    coordinator: RestoreCoordinator,
    scheduler: AutoCheckpointScheduler,
    executor: Arc<dyn RunExecutor>,
}

impl std::fmt::Debug for CheckpointService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointService")
            .field("settings", &self.settings)
            .field("ledger", &self.ledger)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl CheckpointService {
    pub fn builder(executor: Arc<dyn RunExecutor>) -> CheckpointServiceBuilder {
        CheckpointServiceBuilder::new(executor)
    }

    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &CheckpointLedger {
        &self.ledger
    }

    /// Record a manual checkpoint of `state` taken at `step_number`.
    ///
    /// Waits for the run lock up to `locking.acquire_timeout_ms`, then fails with
    /// `Concurrency`. A blank description is dropped.
    pub async fn create_manual_checkpoint(
        &self,
        run_id: &RunId,
        step_number: u64,
        state: StateBlob,
        description: Option<String>,
    ) -> Result<Checkpoint> {
        let request = manual_request(run_id, step_number, state, description);
        self.ledger.create_checkpoint(request).await
    }

    /// Take a manual checkpoint of the run's live state, read from the executor.
    ///
    /// The run lock is held from before the read until the checkpoint is committed, so a
    /// restore cannot slip in between.
    pub async fn capture_checkpoint(
        &self,
        run_id: &RunId,
        description: Option<String>,
    ) -> Result<Checkpoint> {
        let guard = self.ledger.lock_run(run_id).await?;
        let info = self.executor.run_info(run_id).await?;
        let state = self.executor.capture_state(run_id).await?;

        let request =
            manual_request(run_id, info.current_step, state, description).with_usage(info.usage);
        self.ledger.create_locked(&guard, request).await
    }

    /// Record a checkpoint whose state the host captured itself, e.g. around a tool call.
    pub async fn create_checkpoint(&self, request: CheckpointRequest) -> Result<Checkpoint> {
        self.ledger.create_checkpoint(request).await
    }

    /// Newest first
    pub async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        self.ledger.list_checkpoints(run_id).await
    }

    pub async fn get_checkpoint(&self, run_id: &RunId, version: Version) -> Result<Checkpoint> {
        self.ledger.get_checkpoint(run_id, version).await
    }

    pub async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        self.ledger.latest_checkpoint(run_id).await
    }

    /// Metadata and state blob of a checkpoint, looked up by ID
    pub async fn get_checkpoint_data(&self, checkpoint_id: &str) -> Result<CheckpointData> {
        let checkpoint = self.ledger.find_checkpoint(checkpoint_id).await?;
        let state = self.ledger.load_snapshot(&checkpoint).await?;
        Ok(CheckpointData { checkpoint, state })
    }

    /// Diff the state of checkpoint `id_a` (before) against `id_b` (after)
    pub async fn compare_checkpoints(&self, id_a: &str, id_b: &str) -> Result<CheckpointComparison> {
        let (from, to) = futures::try_join!(
            self.ledger.find_checkpoint(id_a),
            self.ledger.find_checkpoint(id_b)
        )?;
        let (before, after) = futures::try_join!(
            self.ledger.load_snapshot(&from),
            self.ledger.load_snapshot(&to)
        )?;

        let items = compute_diff(&before, &after);
        let summary = DiffSummary::from_items(&items);
        Ok(CheckpointComparison {
            from,
            to,
            summary,
            items,
        })
    }

    pub async fn request_restore(&self, run_id: &RunId, version: Version) -> Result<RestoreHandle> {
        self.coordinator.request_restore(run_id, version).await
    }

    pub async fn confirm_restore(
        &self,
        handle: RestoreHandle,
        confirmation: Confirmation,
    ) -> Result<RestoreResult> {
        self.coordinator.confirm_restore(handle, confirmation).await
    }

    pub fn cancel_restore(&self, handle: RestoreHandle) {
        self.coordinator.cancel_restore(handle)
    }

    /// Confirmed restores of a run, newest first
    pub async fn restore_history(&self, run_id: &RunId) -> Vec<RestoreRecord> {
        self.coordinator.restore_history(run_id).await
    }

    /// Enable, re-arm or disable auto checkpoints for a run
    pub fn configure_auto_checkpoint(
        &self,
        run_id: &RunId,
        enabled: bool,
        interval_seconds: u64,
    ) -> Result<AutoCheckpointConfig> {
        self.scheduler.configure(run_id, enabled, interval_seconds)
    }

    pub fn auto_checkpoint_config(&self, run_id: &RunId) -> Option<AutoCheckpointConfig> {
        self.scheduler.config(run_id)
    }

    /// Announce a new run. Applies `scheduler.enabled_by_default` if the run has no schedule.
    pub fn register_run(&self, run_id: &RunId) -> Result<Option<AutoCheckpointConfig>> {
        if let Some(config) = self.scheduler.config(run_id) {
            return Ok(Some(config));
        }
        match self.settings.default_auto_checkpoint() {
            Some(default) => self
                .scheduler
                .configure(run_id, true, default.interval_seconds)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Stop every auto-checkpoint schedule, letting in-flight ticks finish
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("Checkpoint service stopped");
    }
}

fn manual_request(
    run_id: &RunId,
    step_number: u64,
    state: StateBlob,
    description: Option<String>,
) -> CheckpointRequest {
    let request = CheckpointRequest::new(run_id.clone(), step_number, CheckpointType::Manual, state);
    match description.filter(|d| !d.trim().is_empty()) {
        Some(description) => request.with_description(description),
        None => request,
    }
}

/// Assembles a [`CheckpointService`]
///
/// Stores default to the backend named in `settings.storage`.
pub struct CheckpointServiceBuilder {
    executor: Arc<dyn RunExecutor>,
    settings: CheckpointSettings,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CheckpointServiceBuilder {
    pub fn new(executor: Arc<dyn RunExecutor>) -> Self {
        Self {
            executor,
            settings: CheckpointSettings::default(),
            ledger_store: None,
            snapshot_store: None,
            clock: None,
        }
    }

    pub fn settings(mut self, settings: CheckpointSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<CheckpointService> {
        self.settings.validate()?;

        let data_path = self.settings.data_path();
        let backend = self.settings.storage.backend;
        let ledger_store: Arc<dyn LedgerStore> = match self.ledger_store {
            Some(store) => store,
            None => match backend {
                StorageBackend::Memory => Arc::new(InMemoryLedgerStore::new()),
                StorageBackend::Filesystem => Arc::new(FsLedgerStore::new(data_path.join("ledger"))),
            },
        };
        let snapshot_store: Arc<dyn SnapshotStore> = match self.snapshot_store {
            Some(store) => store,
            None => match backend {
                StorageBackend::Memory => Arc::new(InMemorySnapshotStore::new()),
                StorageBackend::Filesystem => {
                    Arc::new(FsSnapshotStore::new(data_path.join("snapshots")))
                }
            },
        };

        let ledger = CheckpointLedger::new(ledger_store, snapshot_store)
            .with_clock(self.clock.unwrap_or_else(|| Arc::new(SystemClock)))
            .with_lock_timeout(self.settings.lock_timeout());
        let coordinator = RestoreCoordinator::new(ledger.clone(), self.executor.clone())
            .with_retry_policy(self.settings.retry_policy());
        let scheduler = AutoCheckpointScheduler::new(ledger.clone(), self.executor.clone());

        info!(backend = ?backend, "Checkpoint service ready");
        Ok(CheckpointService {
            settings: self.settings,
            ledger,
            coordinator,
            scheduler,
            executor: self.executor,
        })
    }
}
