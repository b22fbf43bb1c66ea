//! # run-checkpoint - Versioned Checkpoints for Agent Runs
//!
//! **Checkpoint versioning and restore** for long-running agent runs: periodic snapshots of
//! run state, inspection and comparison of snapshots, and rollback to an earlier point while
//! keeping a consistent, auditable history.
//!
//! ## Overview
//!
//! The state of a run is an opaque JSON blob. This crate only cares about its identity and
//! its structural diff. It gives a run:
//!
//! - **A gapless version history** - v1, v2, v3, ... per run, never reused, never deleted
//! - **Structural comparison** - key-level diff between any two checkpoints
//! - **Confirmed rollback** - restore to a valid checkpoint, invalidating everything newer
//! - **Auto checkpoints** - a per-run timer that never blocks on a busy run
//!
//! ## Core Concepts
//!
//! ### 1. Ledger
//!
//! [`CheckpointLedger`] is the only writer of checkpoint metadata. It serializes creation per
//! run, assigns versions, writes the blob to the [`SnapshotStore`] and then appends the
//! record to the [`LedgerStore`]. A failed blob write commits nothing.
//!
//! ### 2. Diff
//!
//! [`compute_diff`] classifies every top-level key of two blobs as `changed`, `added`,
//! `removed` or `unchanged`. Equality is canonical: object key order does not matter,
//! array order does.
//!
//! ### 3. Restore
//!
//! [`RestoreCoordinator`] runs a two-phase restore. [`request_restore`] returns a
//! [`RestoreHandle`] that must be confirmed with its token before anything changes:
//!
//! ```text
//! v1 ── v2 ── v3 ── v4 ── v5      restore to v3
//!                   ✗     ✗       v4, v5 invalidated, run state replaced by v3's blob
//!
//! the next checkpoint of the run is v6
//! ```
//!
//! ### 4. Auto checkpoints
//!
//! [`AutoCheckpointScheduler`] keeps one Tokio task per enabled run. A tick that finds the
//! run lock held is skipped, never queued.
//!
//! ## Quick Start
//!
//! ```rust
//! use run_checkpoint::{
//!     compute_diff, CheckpointLedger, CheckpointRequest, CheckpointType, DiffKind,
//!     InMemoryLedgerStore, InMemorySnapshotStore,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> run_checkpoint::Result<()> {
//! let ledger = CheckpointLedger::new(
//!     Arc::new(InMemoryLedgerStore::new()),
//!     Arc::new(InMemorySnapshotStore::new()),
//! );
//!
//! let v1 = ledger
//!     .create_checkpoint(CheckpointRequest::new(
//!         "run-42",
//!         10,
//!         CheckpointType::Manual,
//!         json!({"a": 1, "b": 2}),
//!     ))
//!     .await?;
//! let v2 = ledger
//!     .create_checkpoint(CheckpointRequest::new(
//!         "run-42",
//!         12,
//!         CheckpointType::Auto,
//!         json!({"a": 1, "b": 3, "c": 4}),
//!     ))
//!     .await?;
//! assert_eq!((v1.version, v2.version), (1, 2));
//!
//! let diff = compute_diff(&ledger.load_snapshot(&v1).await?, &ledger.load_snapshot(&v2).await?);
//! assert_eq!(diff[0].key, "b");
//! assert_eq!(diff[0].kind, DiffKind::Changed);
//! # Ok(())
//! # }
//! ```
//!
//! Applications normally go through [`CheckpointService`], which wires all of the above
//! from [`CheckpointSettings`].
//!
//! ## Storage
//!
//! | Backend | Snapshots | Ledger |
//! |---------|-----------|--------|
//! | memory | [`InMemorySnapshotStore`] | [`InMemoryLedgerStore`] |
//! | filesystem | [`FsSnapshotStore`] | [`FsLedgerStore`] |
//!
//! [`request_restore`]: RestoreCoordinator::request_restore

pub mod checkpoint;
pub mod config;
pub mod diff;
pub mod error;
pub mod fs;
pub mod ledger;
pub mod lock;
pub mod memory;
pub mod restore;
pub mod retry;
pub mod scheduler;
pub mod serializer;
pub mod service;
pub mod traits;

// Re-export main types
pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointRequest, CheckpointType, RunId, RunInfo, RunStatus,
    StateBlob, UsageCounters, Version,
};
pub use config::{
    load_settings, CheckpointSettings, ConfigLoader, LockingSettings, LoggingSettings,
    RestoreSettings, SchedulerSettings, StorageBackend, StorageSettings,
};
pub use diff::{canonical_json, compute_diff, DiffItem, DiffKind, DiffSummary, ROOT_KEY};
pub use error::{CheckpointError, RestoreStep, Result};
pub use fs::{FsLedgerStore, FsSnapshotStore};
pub use ledger::{CheckpointLedger, DEFAULT_LOCK_TIMEOUT};
pub use lock::{RunGuard, RunLocks};
pub use memory::{InMemoryLedgerStore, InMemoryRunExecutor, InMemorySnapshotStore};
pub use restore::{
    Confirmation, ConfirmationToken, RestoreCoordinator, RestoreHandle, RestoreOutcome,
    RestoreRecord, RestoreResult, RestoreState,
};
pub use retry::RetryPolicy;
pub use scheduler::{AutoCheckpointConfig, AutoCheckpointScheduler, TickOutcome};
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use service::{CheckpointComparison, CheckpointData, CheckpointService, CheckpointServiceBuilder};
pub use traits::{Clock, LedgerStore, RunExecutor, SnapshotStore, StoreLease, SystemClock};
