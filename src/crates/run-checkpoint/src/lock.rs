//! Per-run mutual exclusion
//!
//! Every run has one lock shared by checkpoint creation and restore. Holding a [`RunGuard`]
//! is the only way to reach the ledger's mutating internals, so "who holds the lock" is
//! checked by the type system rather than by convention. Locks of different runs are
//! independent.
//!
//! A guard can also carry a [`StoreLease`] from the ledger store. Stores shared between
//! processes (the filesystem backend) hand one out so that the whole critical section is
//! exclusive across processes, not only across tasks.

use crate::checkpoint::RunId;
use crate::error::{CheckpointError, Result};
use crate::traits::StoreLease;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type Slots = DashMap<RunId, Arc<Mutex<()>>>;

/// Proof that the caller holds the lock of `run_id`. Released on drop.
pub struct RunGuard {
    run_id: RunId,
    slots: Arc<Slots>,
    lease: Option<StoreLease>,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("run_id", &self.run_id)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl RunGuard {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Keep a store lease alive for as long as this guard
    pub(crate) fn attach_lease(&mut self, lease: Option<StoreLease>) {
        self.lease = lease;
    }

    pub(crate) fn ensure_for(&self, run_id: &RunId) -> Result<()> {
        if &self.run_id != run_id {
            return Err(CheckpointError::Validation(format!(
                "lock held for run {} cannot be used for run {}",
                self.run_id, run_id
            )));
        }
        Ok(())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Drop the slot once nobody else holds or waits for it: the map and our own
        // mutex guard are the only two owners left.
        let own = OwnedMutexGuard::mutex(&self._guard);
        self.slots.remove_if(&self.run_id, |_, slot| {
            Arc::ptr_eq(slot, own) && Arc::strong_count(slot) <= 2
        });
    }
}

/// Registry of per-run locks
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    locks: Arc<Slots>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        self.locks
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, run_id: &RunId, guard: OwnedMutexGuard<()>) -> RunGuard {
        RunGuard {
            run_id: run_id.clone(),
            slots: self.locks.clone(),
            lease: None,
            _guard: guard,
        }
    }

    /// Wait for the run's lock, giving up with `Concurrency` after `timeout`.
    pub async fn acquire(&self, run_id: &RunId, timeout: Duration) -> Result<RunGuard> {
        let slot = self.slot(run_id);
        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(self.guard(run_id, guard)),
            Err(_) => {
                debug!(run_id = %run_id, ?timeout, "Timed out waiting for run lock");
                Err(CheckpointError::Concurrency {
                    run_id: run_id.clone(),
                })
            }
        }
    }

    /// Take the run's lock only if it is free right now.
    pub fn try_acquire(&self, run_id: &RunId) -> Result<RunGuard> {
        let slot = self.slot(run_id);
        slot.try_lock_owned()
            .map(|guard| self.guard(run_id, guard))
            .map_err(|_| CheckpointError::Concurrency {
                run_id: run_id.clone(),
            })
    }

    /// Whether some operation currently holds the run's lock.
    pub fn is_locked(&self, run_id: &RunId) -> bool {
        self.locks
            .get(run_id)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Runs with a live lock slot
    pub fn tracked_runs(&self) -> usize {
        self.locks.len()
    }
}
