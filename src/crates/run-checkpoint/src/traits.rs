//! Collaborator traits the checkpoint core is built against
//!
//! The core owns no storage and does not run agents. It is wired to four seams:
//!
//! - [`SnapshotStore`] - durable blob storage addressed by `snapshot_ref`
//! - [`LedgerStore`] - durable storage of checkpoint metadata, one ordered list per run
//! - [`RunExecutor`] - the component that actually runs the agent task
//! - [`Clock`] - wall clock for `created_at`
//!
//! ```text
//!   CheckpointLedger ──put/get──▶ SnapshotStore
//!         │
//!         └──append/mark_invalid_above──▶ LedgerStore
//!
//!   RestoreCoordinator ──rewind/set_status──▶ RunExecutor
//!   AutoCheckpointScheduler ──run_info/capture_state──▶ RunExecutor
//! ```
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use run_checkpoint::{SnapshotStore, StateBlob, Result};
//!
//! struct S3Store { /* ... */ }
//!
//! #[async_trait]
//! impl SnapshotStore for S3Store {
//!     async fn put(&self, key: &str, blob: &StateBlob) -> Result<()> { todo!() }
//!     async fn get(&self, key: &str) -> Result<Option<StateBlob>> { todo!() }
//! }
//! ```
//!
//! Backends report I/O trouble as [`CheckpointError::Persistence`](crate::CheckpointError).
//! `get` returns `Ok(None)` for an absent key rather than an error, so callers can tell
//! "missing" from "unreachable".

use crate::{
    checkpoint::{Checkpoint, RunId, RunInfo, RunStatus, StateBlob, Version},
    error::Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::time::Duration;

/// Exclusive hold on a run granted by a [`LedgerStore`]. Released on drop.
pub type StoreLease = Box<dyn Any + Send + Sync>;

/// Durable blob storage. Append-only from the core's point of view.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a blob under `key`. Keys are never reused by the ledger.
    async fn put(&self, key: &str, blob: &StateBlob) -> Result<()>;

    /// Fetch a blob, `Ok(None)` if the key is unknown.
    async fn get(&self, key: &str) -> Result<Option<StateBlob>>;

    /// Whether a blob exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Durable checkpoint metadata storage.
///
/// Implementations keep each run's records in version order. Only
/// [`CheckpointLedger`](crate::ledger::CheckpointLedger) writes through this trait.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// All checkpoints of a run, oldest first. Unknown runs yield an empty list.
    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>>;

    /// Append a record. The caller guarantees `checkpoint.version` is the next version.
    async fn append(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Look a checkpoint up by its unique ID across all runs.
    async fn find_by_id(&self, id: &str) -> Result<Option<Checkpoint>>;

    /// Set `is_valid = false` on every record of the run with `version > above`.
    /// Returns the versions that flipped during this call.
    async fn mark_invalid_above(&self, run_id: &RunId, above: Version) -> Result<Vec<Version>>;

    /// Runs that have at least one checkpoint.
    async fn runs(&self) -> Result<Vec<RunId>>;

    /// Exclusive lease on a run, for stores that other processes write too.
    ///
    /// The ledger holds it next to its in-process run lock for the whole create or restore.
    /// Waits up to `timeout`, then fails with `Concurrency`. Stores private to one process
    /// keep the default and return `Ok(None)`.
    async fn lease_run(&self, _run_id: &RunId, _timeout: Duration) -> Result<Option<StoreLease>> {
        Ok(None)
    }

    /// Like [`lease_run`](Self::lease_run) but fails with `Concurrency` instead of waiting.
    fn try_lease_run(&self, _run_id: &RunId) -> Result<Option<StoreLease>> {
        Ok(None)
    }
}

/// The run-execution side of a restore and of auto checkpoints.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Replace the run's live state with `state`. An error means the run is unchanged.
    async fn apply_state(&self, run_id: &RunId, state: &StateBlob) -> Result<()>;

    /// Put the run back at a checkpoint: `state` and the checkpoint's `step_number`.
    ///
    /// Executors that do not track steps themselves can keep the default, which only
    /// applies the state.
    async fn rewind(&self, run_id: &RunId, _step_number: u64, state: &StateBlob) -> Result<()> {
        self.apply_state(run_id, state).await
    }

    /// Move the run to `status`.
    async fn set_status(&self, run_id: &RunId, status: RunStatus) -> Result<()>;

    /// Current step, status and usage of the run.
    async fn run_info(&self, run_id: &RunId) -> Result<RunInfo>;

    /// The run's live state, used for auto checkpoints.
    async fn capture_state(&self, run_id: &RunId) -> Result<StateBlob>;
}

/// Source of `created_at` timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
