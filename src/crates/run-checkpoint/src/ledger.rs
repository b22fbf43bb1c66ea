//! The checkpoint ledger: version assignment and validity for each run
//!
//! [`CheckpointLedger`] is the single writer of checkpoint metadata. It serializes creation
//! per run through [`RunLocks`], assigns `max version + 1` while the lock is held, writes
//! the state blob before the metadata record, and only ever flips `is_valid` from true to
//! false through [`CheckpointLedger::invalidate_above`], which requires a [`RunGuard`].
//!
//! # Creation sequence
//!
//! ```text
//! lock(run) ─▶ load_run ─▶ version = max + 1 ─▶ SnapshotStore::put ─▶ LedgerStore::append
//!    │                                              │ fails                 │ fails
//!    │                                              ▼                       ▼
//!    │                                   PersistenceError, nothing committed, cursor unchanged
//!    ▼
//! unlock on return
//! ```

use crate::{
    checkpoint::{Checkpoint, CheckpointRequest, RunId, StateBlob, Version},
    error::{CheckpointError, Result},
    lock::{RunGuard, RunLocks},
    traits::{Clock, LedgerStore, SnapshotStore, SystemClock},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default time a manual create or a restore waits for the run lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Authoritative record of checkpoint metadata per run
#[derive(Clone)]
pub struct CheckpointLedger {
    store: Arc<dyn LedgerStore>,
    snapshots: Arc<dyn SnapshotStore>,
    locks: RunLocks,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for CheckpointLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointLedger")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl CheckpointLedger {
    /// Create a ledger over the given metadata and snapshot stores
    pub fn new(store: Arc<dyn LedgerStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            snapshots,
            locks: RunLocks::new(),
            clock: Arc::new(SystemClock),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Use a different clock for `created_at`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set how long `create_checkpoint` and restores wait for the run lock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn snapshot_store(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    pub(crate) fn locks(&self) -> &RunLocks {
        &self.locks
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wait for the run lock, up to the configured timeout.
    ///
    /// The in-process lock comes first, then the store's lease (if it hands one out) with
    /// whatever is left of the timeout.
    pub(crate) async fn lock_run(&self, run_id: &RunId) -> Result<RunGuard> {
        let started = Instant::now();
        let mut guard = self.locks.acquire(run_id, self.lock_timeout).await?;
        let remaining = self.lock_timeout.saturating_sub(started.elapsed());
        guard.attach_lease(self.store.lease_run(run_id, remaining).await?);
        Ok(guard)
    }

    /// Take the run lock only if it is free right now, else `Concurrency`.
    pub(crate) fn try_lock_run(&self, run_id: &RunId) -> Result<RunGuard> {
        let mut guard = self.locks.try_acquire(run_id)?;
        guard.attach_lease(self.store.try_lease_run(run_id)?);
        Ok(guard)
    }

    /// Create a checkpoint, waiting for the run lock if another operation holds it.
    ///
    /// Fails with `Concurrency` if the lock is not granted within the lock timeout and
    /// with `Persistence` if the blob or the record cannot be written. On failure no
    /// record is committed and the next successful call gets the same version.
    pub async fn create_checkpoint(&self, request: CheckpointRequest) -> Result<Checkpoint> {
        let guard = self.lock_run(&request.run_id).await?;
        self.create_locked(&guard, request).await
    }

    /// Create a checkpoint only if the run lock is free right now.
    ///
    /// Used by the scheduler: a busy run yields `Concurrency` immediately.
    pub async fn try_create_checkpoint(&self, request: CheckpointRequest) -> Result<Checkpoint> {
        let guard = self.try_lock_run(&request.run_id)?;
        self.create_locked(&guard, request).await
    }

    /// Create a checkpoint under a run lock the caller already holds.
    pub(crate) async fn create_locked(&self, guard: &RunGuard, request: CheckpointRequest) -> Result<Checkpoint> {
        guard.ensure_for(&request.run_id)?;

        let existing = self
            .store
            .load_run(&request.run_id)
            .await
            .map_err(|e| as_persistence("loading ledger", e))?;
        let last = existing.last();

        let version = last.map(|c| c.version + 1).unwrap_or(1);
        let now = self.clock.now();
        let created_at = match last {
            Some(prev) if prev.created_at > now => prev.created_at,
            _ => now,
        };

        let id = Checkpoint::new_id();
        let snapshot_ref = Checkpoint::snapshot_key(&request.run_id, version, &id);

        let checkpoint = Checkpoint {
            id,
            run_id: request.run_id,
            version,
            step_number: request.step_number,
            checkpoint_type: request.checkpoint_type,
            description: request.description,
            created_at,
            tokens_used: request.usage.tokens_used,
            execution_time_ms: request.usage.execution_time_ms,
            is_valid: true,
            snapshot_ref,
        };

        self.snapshots
            .put(&checkpoint.snapshot_ref, &request.state)
            .await
            .map_err(|e| {
                warn!(run_id = %checkpoint.run_id, version, error = %e, "Snapshot write failed");
                as_persistence("writing snapshot", e)
            })?;

        // The blob is orphaned if this fails; it is unreachable without a record.
        self.store.append(&checkpoint).await.map_err(|e| {
            warn!(run_id = %checkpoint.run_id, version, error = %e, "Ledger append failed");
            as_persistence("appending checkpoint", e)
        })?;

        info!(
            run_id = %checkpoint.run_id,
            version,
            checkpoint_id = %checkpoint.id,
            kind = %checkpoint.checkpoint_type,
            step = checkpoint.step_number,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// All checkpoints of a run, newest first
    pub async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.store.load_run(run_id).await?;
        checkpoints.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(checkpoints)
    }

    /// A run's checkpoint by version
    pub async fn get_checkpoint(&self, run_id: &RunId, version: Version) -> Result<Checkpoint> {
        self.store
            .load_run(run_id)
            .await?
            .into_iter()
            .find(|c| c.version == version)
            .ok_or_else(|| {
                CheckpointError::NotFound(format!("checkpoint v{} of run {}", version, run_id))
            })
    }

    /// A checkpoint by its unique ID
    pub async fn find_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.store
            .find_by_id(checkpoint_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(format!("checkpoint {}", checkpoint_id)))
    }

    /// The newest checkpoint of a run, valid or not
    pub async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        Ok(self.store.load_run(run_id).await?.into_iter().last())
    }

    /// Highest version ever assigned in the run, 0 if none
    pub async fn current_max_version(&self, run_id: &RunId) -> Result<Version> {
        Ok(self
            .store
            .load_run(run_id)
            .await?
            .last()
            .map(|c| c.version)
            .unwrap_or(0))
    }

    /// Runs with at least one checkpoint
    pub async fn runs(&self) -> Result<Vec<RunId>> {
        self.store.runs().await
    }

    /// The state blob behind a checkpoint
    pub async fn load_snapshot(&self, checkpoint: &Checkpoint) -> Result<StateBlob> {
        self.snapshots
            .get(&checkpoint.snapshot_ref)
            .await?
            .ok_or_else(|| CheckpointError::SnapshotMissing {
                snapshot_ref: checkpoint.snapshot_ref.clone(),
                version: checkpoint.version,
            })
    }

    /// Invalidate every checkpoint of the guarded run newer than `version`.
    ///
    /// Idempotent. Returns the versions flipped by this call.
    pub(crate) async fn invalidate_above(
        &self,
        guard: &RunGuard,
        version: Version,
    ) -> Result<Vec<Version>> {
        let run_id = guard.run_id();
        let flipped = self
            .store
            .mark_invalid_above(run_id, version)
            .await
            .map_err(|e| as_persistence("invalidating checkpoints", e))?;

        if flipped.is_empty() {
            debug!(run_id = %run_id, above = version, "No checkpoints to invalidate");
        } else {
            info!(run_id = %run_id, above = version, invalidated = ?flipped, "Checkpoints invalidated");
        }
        Ok(flipped)
    }
}

fn as_persistence(context: &str, err: CheckpointError) -> CheckpointError {
    match err {
        CheckpointError::Persistence(_) => err,
        other => CheckpointError::persistence(context, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointType;
    use crate::memory::{InMemoryLedgerStore, InMemorySnapshotStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    /// Snapshot store that can be switched to fail every write
    #[derive(Default)]
    struct FlakySnapshots {
        inner: InMemorySnapshotStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl SnapshotStore for FlakySnapshots {
        async fn put(&self, key: &str, blob: &StateBlob) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CheckpointError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(key, blob).await
        }

        async fn get(&self, key: &str) -> Result<Option<StateBlob>> {
            self.inner.get(key).await
        }
    }

    /// Clock that goes backwards one second per call
    struct RewindingClock {
        base: DateTime<Utc>,
        calls: AtomicI64,
    }

    impl Clock for RewindingClock {
        fn now(&self) -> DateTime<Utc> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.base - ChronoDuration::seconds(n)
        }
    }

    fn ledger() -> CheckpointLedger {
        CheckpointLedger::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
        )
    }

    fn request(run: &str, step: u64) -> CheckpointRequest {
        CheckpointRequest::new(run, step, CheckpointType::Manual, json!({ "step": step }))
    }

    #[tokio::test]
    async fn test_versions_start_at_one_and_have_no_gaps() {
        let ledger = ledger();
        let mut versions = Vec::new();
        for step in [10, 12, 12, 15] {
            versions.push(ledger.create_checkpoint(request("run-1", step)).await.unwrap().version);
        }
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert_eq!(ledger.current_max_version(&"run-1".into()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_runs_have_independent_versions() {
        let ledger = ledger();
        ledger.create_checkpoint(request("run-a", 1)).await.unwrap();
        ledger.create_checkpoint(request("run-a", 2)).await.unwrap();
        let b = ledger.create_checkpoint(request("run-b", 1)).await.unwrap();
        assert_eq!(b.version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_are_serialized() {
        let ledger = ledger();
        let mut handles = Vec::new();
        for step in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.create_checkpoint(request("run-1", step)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut versions: Vec<_> = ledger
            .list_checkpoints(&"run-1".into())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.version)
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_snapshot_failure_commits_nothing() {
        let snapshots = Arc::new(FlakySnapshots::default());
        let ledger = CheckpointLedger::new(Arc::new(InMemoryLedgerStore::new()), snapshots.clone());
        let run: RunId = "run-1".into();

        ledger.create_checkpoint(request("run-1", 1)).await.unwrap();

        snapshots.failing.store(true, Ordering::SeqCst);
        let err = ledger.create_checkpoint(request("run-1", 2)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Persistence(_)));
        assert_eq!(ledger.current_max_version(&run).await.unwrap(), 1);
        assert_eq!(ledger.list_checkpoints(&run).await.unwrap().len(), 1);

        snapshots.failing.store(false, Ordering::SeqCst);
        let next = ledger.create_checkpoint(request("run-1", 2)).await.unwrap();
        assert_eq!(next.version, 2);
    }

    #[tokio::test]
    async fn test_created_at_never_goes_backwards() {
        let clock = Arc::new(RewindingClock {
            base: Utc::now(),
            calls: AtomicI64::new(0),
        });
        let ledger = ledger().with_clock(clock);

        let first = ledger.create_checkpoint(request("run-1", 1)).await.unwrap();
        let second = ledger.create_checkpoint(request("run-1", 2)).await.unwrap();
        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_try_create_fails_fast_when_locked() {
        let ledger = ledger();
        let run: RunId = "run-1".into();
        let guard = ledger.lock_run(&run).await.unwrap();

        let err = ledger.try_create_checkpoint(request("run-1", 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Concurrency { .. }));

        drop(guard);
        assert_eq!(ledger.try_create_checkpoint(request("run-1", 1)).await.unwrap().version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_create_reports_busy_after_timeout() {
        let ledger = ledger().with_lock_timeout(Duration::from_millis(100));
        let _guard = ledger.lock_run(&"run-1".into()).await.unwrap();

        let err = ledger.create_checkpoint(request("run-1", 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Concurrency { .. }));
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_get_by_version() {
        let ledger = ledger();
        for step in 1..=3 {
            ledger.create_checkpoint(request("run-1", step)).await.unwrap();
        }
        let run: RunId = "run-1".into();

        let listed: Vec<_> = ledger
            .list_checkpoints(&run)
            .await
            .unwrap()
            .iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(listed, vec![3, 2, 1]);

        assert_eq!(ledger.get_checkpoint(&run, 2).await.unwrap().step_number, 2);
        assert!(matches!(
            ledger.get_checkpoint(&run, 9).await,
            Err(CheckpointError::NotFound(_))
        ));
        assert!(ledger.list_checkpoints(&"unknown".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_above_is_idempotent() {
        let ledger = ledger();
        for step in 1..=5 {
            ledger.create_checkpoint(request("run-1", step)).await.unwrap();
        }
        let run: RunId = "run-1".into();
        let guard = ledger.lock_run(&run).await.unwrap();

        assert_eq!(ledger.invalidate_above(&guard, 3).await.unwrap(), vec![4, 5]);
        assert!(ledger.invalidate_above(&guard, 3).await.unwrap().is_empty());
        drop(guard);

        let validity: Vec<_> = ledger
            .list_checkpoints(&run)
            .await
            .unwrap()
            .into_iter()
            .map(|c| (c.version, c.is_valid))
            .collect();
        assert_eq!(
            validity,
            vec![(5, false), (4, false), (3, true), (2, true), (1, true)]
        );
    }

    #[tokio::test]
    async fn test_load_snapshot_and_find_by_id() {
        let ledger = ledger();
        let created = ledger.create_checkpoint(request("run-1", 7)).await.unwrap();

        let found = ledger.find_checkpoint(&created.id).await.unwrap();
        assert_eq!(found, created);
        assert_eq!(ledger.load_snapshot(&found).await.unwrap(), json!({"step": 7}));
        assert!(ledger.find_checkpoint("nope").await.is_err());
    }
}
