//! Error types for checkpoint operations

use crate::checkpoint::{RunId, Version};
use std::fmt;
use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// The step of a restore at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    /// Confirmation gate before `Executing`
    Confirm,
    /// (a) re-validating the target checkpoint
    ValidateTarget,
    /// (b) fetching the target's snapshot blob
    FetchSnapshot,
    /// (c) handing the blob to the run executor
    ApplyState,
    /// (d) invalidating newer checkpoints
    Invalidate,
    /// (e) moving the run to `resuming`
    SetStatus,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Confirm => "confirm",
            Self::ValidateTarget => "validate target",
            Self::FetchSnapshot => "fetch snapshot",
            Self::ApplyState => "apply state",
            Self::Invalidate => "invalidate newer checkpoints",
            Self::SetStatus => "set run status",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Bad input: interval out of range, malformed settings, mismatched handle
    #[error("Validation error: {0}")]
    Validation(String),

    /// The run's checkpoint lock is held by another operation
    #[error("Run {run_id} is busy with another checkpoint operation, try again")]
    Concurrency { run_id: RunId },

    /// Unknown run, checkpoint or snapshot key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Restore target was invalidated by a later restore
    #[error("Checkpoint v{version} of run {run_id} was invalidated by a later restore")]
    InvalidCheckpoint { run_id: RunId, version: Version },

    /// Restore was not affirmatively confirmed
    #[error("Restore of run {run_id} to v{version} was not confirmed, nothing was changed")]
    NotConfirmed { run_id: RunId, version: Version },

    /// The snapshot blob behind a checkpoint is absent from the store
    #[error("Snapshot {snapshot_ref} for checkpoint v{version} is missing, run unchanged")]
    SnapshotMissing {
        snapshot_ref: String,
        version: Version,
    },

    /// The run executor rejected the restored state
    #[error("Applying restored state to run {run_id} failed, run unchanged: {reason}")]
    ApplyFailed { run_id: RunId, reason: String },

    /// State was applied and the ledger invalidated, but the run status could not be set
    #[error("Run {run_id} restored but its status could not be set to resuming: {reason}")]
    StatusUpdateFailed { run_id: RunId, reason: String },

    /// State was applied but invalidation of newer checkpoints did not commit
    #[error(
        "Run {run_id} restored to v{version} but invalidation of newer checkpoints is incomplete: {reason}"
    )]
    PartialRestore {
        run_id: RunId,
        version: Version,
        reason: String,
    },

    /// Snapshot store or ledger I/O failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CheckpointError {
    /// The restore step this error belongs to, if it is a restore failure.
    pub fn restore_step(&self) -> Option<RestoreStep> {
        match self {
            Self::NotConfirmed { .. } => Some(RestoreStep::Confirm),
            Self::InvalidCheckpoint { .. } => Some(RestoreStep::ValidateTarget),
            Self::SnapshotMissing { .. } => Some(RestoreStep::FetchSnapshot),
            Self::ApplyFailed { .. } => Some(RestoreStep::ApplyState),
            Self::PartialRestore { .. } => Some(RestoreStep::Invalidate),
            Self::StatusUpdateFailed { .. } => Some(RestoreStep::SetStatus),
            _ => None,
        }
    }

    /// Only storage-level failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Io(_))
    }

    pub(crate) fn persistence(context: &str, err: impl fmt::Display) -> Self {
        Self::Persistence(format!("{}: {}", context, err))
    }
}
