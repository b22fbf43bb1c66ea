//! Test doubles that inject failures into the checkpoint collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use run_checkpoint::{
    Checkpoint, CheckpointError, CheckpointLedger, InMemoryLedgerStore, InMemoryRunExecutor,
    InMemorySnapshotStore, LedgerStore, Result, RestoreCoordinator, RetryPolicy, RunExecutor,
    RunId, RunInfo, RunStatus, SnapshotStore, StateBlob, Version,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Run executor whose `apply_state` / `set_status` can be made to fail
#[derive(Clone, Default)]
pub struct FaultyExecutor {
    pub inner: InMemoryRunExecutor,
    pub fail_apply: Arc<AtomicBool>,
    pub fail_status: Arc<AtomicBool>,
}

#[async_trait]
impl RunExecutor for FaultyExecutor {
    async fn apply_state(&self, run_id: &RunId, state: &StateBlob) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(CheckpointError::Validation("state rejected by run".into()));
        }
        self.inner.apply_state(run_id, state).await
    }

    async fn rewind(&self, run_id: &RunId, step_number: u64, state: &StateBlob) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(CheckpointError::Validation("state rejected by run".into()));
        }
        self.inner.rewind(run_id, step_number, state).await
    }

    async fn set_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(CheckpointError::Persistence("status service down".into()));
        }
        self.inner.set_status(run_id, status).await
    }

    async fn run_info(&self, run_id: &RunId) -> Result<RunInfo> {
        self.inner.run_info(run_id).await
    }

    async fn capture_state(&self, run_id: &RunId) -> Result<StateBlob> {
        self.inner.capture_state(run_id).await
    }
}

/// Ledger store whose next `failing_invalidations` calls to `mark_invalid_above` fail
#[derive(Clone, Default)]
pub struct FlakyLedgerStore {
    pub inner: InMemoryLedgerStore,
    pub failing_invalidations: Arc<AtomicUsize>,
    pub invalidation_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl LedgerStore for FlakyLedgerStore {
    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        self.inner.load_run(run_id).await
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner.append(checkpoint).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.inner.find_by_id(id).await
    }

    async fn mark_invalid_above(&self, run_id: &RunId, above: Version) -> Result<Vec<Version>> {
        self.invalidation_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_invalidations.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_invalidations.store(remaining - 1, Ordering::SeqCst);
            return Err(CheckpointError::Persistence("ledger write timed out".into()));
        }
        self.inner.mark_invalid_above(run_id, above).await
    }

    async fn runs(&self) -> Result<Vec<RunId>> {
        self.inner.runs().await
    }
}

/// Snapshot store that can park a `put` until released
#[derive(Clone, Default)]
pub struct GatedSnapshotStore {
    pub inner: InMemorySnapshotStore,
    pub hold: Arc<AtomicBool>,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl SnapshotStore for GatedSnapshotStore {
    async fn put(&self, key: &str, blob: &StateBlob) -> Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.put(key, blob).await
    }

    async fn get(&self, key: &str) -> Result<Option<StateBlob>> {
        self.inner.get(key).await
    }
}

/// Everything a restore test needs, wired to the faulty doubles
pub struct Fixture {
    pub ledger: CheckpointLedger,
    pub ledger_store: FlakyLedgerStore,
    pub snapshots: InMemorySnapshotStore,
    pub executor: FaultyExecutor,
    pub coordinator: RestoreCoordinator,
}

impl Fixture {
    pub fn new() -> Self {
        let ledger_store = FlakyLedgerStore::default();
        let snapshots = InMemorySnapshotStore::new();
        let executor = FaultyExecutor::default();

        let ledger = CheckpointLedger::new(
            Arc::new(ledger_store.clone()),
            Arc::new(snapshots.clone()),
        );
        let coordinator = RestoreCoordinator::new(ledger.clone(), Arc::new(executor.clone()))
            .with_retry_policy(
                RetryPolicy::new(3)
                    .with_initial_backoff(Duration::from_millis(10))
                    .with_jitter(false),
            );

        Self {
            ledger,
            ledger_store,
            snapshots,
            executor,
            coordinator,
        }
    }

    pub async fn valid_versions(&self, run_id: &RunId) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .ledger
            .list_checkpoints(run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.is_valid)
            .map(|c| c.version)
            .collect();
        versions.sort();
        versions
    }
}
