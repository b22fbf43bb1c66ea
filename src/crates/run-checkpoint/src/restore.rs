//! Restore coordination
//!
//! A restore rolls a run back to a valid checkpoint and invalidates every newer checkpoint.
//! Because invalidation is permanent, a restore is a two-phase exchange:
//!
//! ```text
//! request_restore(run, v) ──▶ RestoreHandle { AwaitingConfirmation, token, steps_to_rollback }
//!                                   │
//!        confirm_restore(handle, Confirmation::Affirm(token))
//!                                   ▼
//!   Executing (run lock held)
//!     (a) re-check target is valid ........ InvalidCheckpoint
//!     (b) fetch snapshot .................. SnapshotMissing
//!     (c) RunExecutor::rewind ............. ApplyFailed
//!     ── nothing has changed up to here ──
//!     (d) invalidate versions > v ......... retried, then PartialRestore
//!     (e) set status resuming ............. StatusUpdateFailed
//!                                   ▼
//!                         Completed | Failed
//! ```
//!
//! Handles are single-use. The coordinator keeps the IDs of pending handles and forgets one
//! as soon as it is confirmed, declined or cancelled, so a copy of a used handle is refused
//! with `NotConfirmed`. A handle that is never confirmed (or is passed to
//! [`RestoreCoordinator::cancel_restore`]) leaves no trace in the ledger.

use crate::{
    checkpoint::{Checkpoint, RunId, RunStatus, Version},
    error::{CheckpointError, RestoreStep, Result},
    ledger::CheckpointLedger,
    lock::RunGuard,
    retry::{with_retry, RetryPolicy},
    traits::RunExecutor,
};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle of a restore request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Requested,
    AwaitingConfirmation,
    Executing,
    Completed,
    Failed,
}

/// Token a caller must echo back to confirm a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmationToken(Uuid);

impl std::fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The caller's answer to a pending restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Proceed. The token must match the handle's.
    Affirm(ConfirmationToken),
    /// Do not proceed
    Decline,
}

/// A restore waiting for confirmation
#[derive(Debug, Clone)]
pub struct RestoreHandle {
    id: Uuid,
    target: Checkpoint,
    current_step: u64,
    steps_to_rollback: i64,
    requested_at: DateTime<Utc>,
    state: RestoreState,
    token: ConfirmationToken,
}

impl RestoreHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn run_id(&self) -> &RunId {
        &self.target.run_id
    }

    /// The checkpoint the run would be rolled back to
    pub fn target(&self) -> &Checkpoint {
        &self.target
    }

    /// The run's step when the restore was requested
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// `current_step - target.step_number`. Display only.
    pub fn steps_to_rollback(&self) -> i64 {
        self.steps_to_rollback
    }

    /// Whether the caller should warn that progress will be lost
    pub fn needs_regression_warning(&self) -> bool {
        self.steps_to_rollback > 0
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// The token to pass back in [`Confirmation::Affirm`]
    pub fn token(&self) -> ConfirmationToken {
        self.token
    }

    /// Shorthand for `Confirmation::Affirm(self.token())`
    pub fn affirm(&self) -> Confirmation {
        Confirmation::Affirm(self.token)
    }
}

/// Outcome of a completed restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub restore_id: Uuid,
    pub run_id: RunId,
    pub success: bool,
    pub state: RestoreState,
    /// The version the run now sits at
    pub current_version: Version,
    /// Versions invalidated by this restore
    pub invalidated: Vec<Version>,
    pub steps_to_rollback: i64,
}

/// How a confirmed restore ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Completed { invalidated: Vec<Version> },
    Failed { step: RestoreStep, reason: String },
}

/// Audit entry for a restore that entered `Executing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub restore_id: Uuid,
    pub run_id: RunId,
    pub target_version: Version,
    pub steps_to_rollback: i64,
    pub requested_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RestoreOutcome,
}

/// Executes restores against the ledger and the run executor
#[derive(Clone)]
pub struct RestoreCoordinator {
    ledger: CheckpointLedger,
    executor: Arc<dyn RunExecutor>,
    retry: RetryPolicy,
    pending: Arc<DashSet<Uuid>>,
    history: Arc<RwLock<HashMap<RunId, Vec<RestoreRecord>>>>,
}

impl std::fmt::Debug for RestoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreCoordinator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RestoreCoordinator {
    pub fn new(ledger: CheckpointLedger, executor: Arc<dyn RunExecutor>) -> Self {
        Self {
            ledger,
            executor,
            retry: RetryPolicy::default(),
            pending: Arc::new(DashSet::new()),
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Retry policy for committing invalidation after the state was applied
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start a restore of `run_id` to `version`.
    ///
    /// Fails with `NotFound` for an unknown checkpoint and `InvalidCheckpoint` for one
    /// already invalidated. Changes nothing.
    pub async fn request_restore(&self, run_id: &RunId, version: Version) -> Result<RestoreHandle> {
        let target = self.ledger.get_checkpoint(run_id, version).await?;
        if !target.is_valid {
            return Err(CheckpointError::InvalidCheckpoint {
                run_id: run_id.clone(),
                version,
            });
        }

        let info = self.executor.run_info(run_id).await?;
        let steps_to_rollback = info.current_step as i64 - target.step_number as i64;

        let mut handle = RestoreHandle {
            id: Uuid::new_v4(),
            target,
            current_step: info.current_step,
            steps_to_rollback,
            requested_at: self.ledger.clock().now(),
            state: RestoreState::Requested,
            token: ConfirmationToken(Uuid::new_v4()),
        };
        handle.state = RestoreState::AwaitingConfirmation;
        self.pending.insert(handle.id);

        info!(
            run_id = %run_id,
            version,
            restore_id = %handle.id,
            steps_to_rollback,
            "Restore requested, awaiting confirmation"
        );
        Ok(handle)
    }

    /// Drop a pending restore. Nothing is changed.
    pub fn cancel_restore(&self, handle: RestoreHandle) {
        self.pending.remove(&handle.id);
        info!(
            run_id = %handle.run_id(),
            version = handle.target.version,
            restore_id = %handle.id,
            "Restore cancelled before confirmation"
        );
    }

    /// Execute a pending restore.
    ///
    /// Without an affirmative confirmation carrying the handle's token, or for a handle that
    /// was already confirmed, declined or cancelled, this fails with `NotConfirmed` and
    /// changes nothing. Once executing, the restore holds the run lock
    /// until it completes or fails and cannot be cancelled.
    pub async fn confirm_restore(
        &self,
        mut handle: RestoreHandle,
        confirmation: Confirmation,
    ) -> Result<RestoreResult> {
        let run_id = handle.run_id().clone();
        let version = handle.target.version;

        if self.pending.remove(&handle.id).is_none() {
            warn!(run_id = %run_id, version, restore_id = %handle.id, "Restore handle already used");
            return Err(CheckpointError::NotConfirmed { run_id, version });
        }
        match confirmation {
            Confirmation::Affirm(token) if token == handle.token => {}
            _ => {
                warn!(run_id = %run_id, version, restore_id = %handle.id, "Restore not confirmed");
                return Err(CheckpointError::NotConfirmed { run_id, version });
            }
        }

        let guard = self.ledger.lock_run(&run_id).await?;
        handle.state = RestoreState::Executing;
        info!(run_id = %run_id, version, restore_id = %handle.id, "Executing restore");

        let outcome = self.execute(&guard, &handle).await;
        drop(guard);

        let finished_at = self.ledger.clock().now();
        match outcome {
            Ok(invalidated) => {
                handle.state = RestoreState::Completed;
                self.record(&handle, finished_at, RestoreOutcome::Completed {
                    invalidated: invalidated.clone(),
                })
                .await;
                info!(
                    run_id = %run_id,
                    version,
                    restore_id = %handle.id,
                    invalidated = ?invalidated,
                    "Restore completed"
                );
                Ok(RestoreResult {
                    restore_id: handle.id,
                    run_id,
                    success: true,
                    state: handle.state,
                    current_version: version,
                    invalidated,
                    steps_to_rollback: handle.steps_to_rollback,
                })
            }
            Err((step, err)) => {
                handle.state = RestoreState::Failed;
                self.record(&handle, finished_at, RestoreOutcome::Failed {
                    step,
                    reason: err.to_string(),
                })
                .await;
                warn!(
                    run_id = %run_id,
                    version,
                    restore_id = %handle.id,
                    %step,
                    error = %err,
                    "Restore failed"
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        guard: &RunGuard,
        handle: &RestoreHandle,
    ) -> std::result::Result<Vec<Version>, (RestoreStep, CheckpointError)> {
        let run_id = guard.run_id();
        let version = handle.target.version;

        // (a) another restore may have invalidated the target since the request
        let target = self
            .ledger
            .get_checkpoint(run_id, version)
            .await
            .map_err(|e| (RestoreStep::ValidateTarget, e))?;
        if !target.is_valid {
            return Err((
                RestoreStep::ValidateTarget,
                CheckpointError::InvalidCheckpoint {
                    run_id: run_id.clone(),
                    version,
                },
            ));
        }

        // (b)
        let state = self
            .ledger
            .load_snapshot(&target)
            .await
            .map_err(|e| (RestoreStep::FetchSnapshot, e))?;

        // (c) state and step both go back to the checkpoint
        self.executor
            .rewind(run_id, target.step_number, &state)
            .await
            .map_err(|e| {
                (
                    RestoreStep::ApplyState,
                    CheckpointError::ApplyFailed {
                        run_id: run_id.clone(),
                        reason: e.to_string(),
                    },
                )
            })?;

        // (d) the run already has the old state, so this must eventually commit
        let invalidated = with_retry(&self.retry, CheckpointError::is_retryable, || {
            self.ledger.invalidate_above(guard, version)
        })
        .await
        .map_err(|(e, attempts)| {
            error!(
                run_id = %run_id,
                version,
                attempts,
                error = %e,
                "Invalidation did not commit, ledger needs reconciliation"
            );
            (
                RestoreStep::Invalidate,
                CheckpointError::PartialRestore {
                    run_id: run_id.clone(),
                    version,
                    reason: format!("{} (after {} attempts)", e, attempts),
                },
            )
        })?;

        // (e)
        self.executor
            .set_status(run_id, RunStatus::Resuming)
            .await
            .map_err(|e| {
                (
                    RestoreStep::SetStatus,
                    CheckpointError::StatusUpdateFailed {
                        run_id: run_id.clone(),
                        reason: e.to_string(),
                    },
                )
            })?;

        Ok(invalidated)
    }

    async fn record(&self, handle: &RestoreHandle, finished_at: DateTime<Utc>, outcome: RestoreOutcome) {
        let record = RestoreRecord {
            restore_id: handle.id,
            run_id: handle.run_id().clone(),
            target_version: handle.target.version,
            steps_to_rollback: handle.steps_to_rollback,
            requested_at: handle.requested_at,
            finished_at,
            outcome,
        };
        self.history
            .write()
            .await
            .entry(record.run_id.clone())
            .or_default()
            .push(record);
    }

    /// Restores of a run that entered `Executing`, newest first
    pub async fn restore_history(&self, run_id: &RunId) -> Vec<RestoreRecord> {
        self.history
            .read()
            .await
            .get(run_id)
            .map(|records| records.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}
