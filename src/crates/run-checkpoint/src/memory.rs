//! In-memory backends for development and testing
//!
//! This module provides reference implementations of the collaborator traits that keep
//! everything in process memory behind `Arc<RwLock<HashMap>>`:
//!
//! - [`InMemorySnapshotStore`] - [`SnapshotStore`]
//! - [`InMemoryLedgerStore`] - [`LedgerStore`]
//! - [`InMemoryRunExecutor`] - [`RunExecutor`] that records applied state and status
//!
//! All three are cheap to clone; clones share storage. Data is lost on restart, so use the
//! [`fs`](crate::fs) backends or your own when checkpoints must survive the process.
//!
//! # Example
//!
//! ```rust
//! use run_checkpoint::{InMemoryLedgerStore, InMemorySnapshotStore, SnapshotStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemorySnapshotStore::new();
//!     store.put("run-1/v1-abc", &json!({"messages": []})).await?;
//!     assert!(store.exists("run-1/v1-abc").await?);
//!
//!     let _ledger = InMemoryLedgerStore::new();
//!     Ok(())
//! }
//! ```

use crate::{
    checkpoint::{Checkpoint, RunId, RunInfo, RunStatus, StateBlob, UsageCounters, Version},
    error::{CheckpointError, Result},
    traits::{LedgerStore, RunExecutor, SnapshotStore},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory snapshot blob storage
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    blobs: Arc<RwLock<HashMap<String, StateBlob>>>,
}

impl InMemorySnapshotStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Drop a blob, simulating data loss in tests
    pub async fn remove(&self, key: &str) -> Option<StateBlob> {
        self.blobs.write().await.remove(key)
    }

    /// Clear all blobs (useful for testing)
    pub async fn clear(&self) {
        self.blobs.write().await.clear();
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn put(&self, key: &str, blob: &StateBlob) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(key) {
            return Err(CheckpointError::Persistence(format!(
                "snapshot {} already exists",
                key
            )));
        }
        blobs.insert(key.to_string(), blob.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StateBlob>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }
}

/// In-memory checkpoint metadata storage
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    runs: Arc<RwLock<HashMap<RunId, Vec<Checkpoint>>>>,
}

impl InMemoryLedgerStore {
    /// Create a new empty ledger store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of checkpoints across all runs
    pub async fn checkpoint_count(&self) -> usize {
        self.runs.read().await.values().map(|entries| entries.len()).sum()
    }

    /// Clear all records (useful for testing)
    pub async fn clear(&self) {
        self.runs.write().await.clear();
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut runs = self.runs.write().await;
        let entries = runs.entry(checkpoint.run_id.clone()).or_default();

        let expected = entries.last().map(|c| c.version + 1).unwrap_or(1);
        if checkpoint.version != expected {
            return Err(CheckpointError::Persistence(format!(
                "refusing out-of-order append: got v{}, expected v{}",
                checkpoint.version, expected
            )));
        }

        entries.push(checkpoint.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Checkpoint>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .flat_map(|entries| entries.iter())
            .find(|c| c.id == id)
            .cloned())
    }

    async fn mark_invalid_above(&self, run_id: &RunId, above: Version) -> Result<Vec<Version>> {
        let mut runs = self.runs.write().await;
        let mut flipped = Vec::new();

        if let Some(entries) = runs.get_mut(run_id) {
            for entry in entries.iter_mut().filter(|c| c.version > above && c.is_valid) {
                entry.is_valid = false;
                flipped.push(entry.version);
            }
        }

        Ok(flipped)
    }

    async fn runs(&self) -> Result<Vec<RunId>> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug, Clone)]
struct RunSlot {
    state: StateBlob,
    info: RunInfo,
}

/// Run executor that keeps each run's live state in memory
///
/// Useful for tests and for hosts that manage run state in-process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunExecutor {
    slots: Arc<RwLock<HashMap<RunId, RunSlot>>>,
}

impl InMemoryRunExecutor {
    /// Create a new executor with no runs
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a run
    pub async fn upsert_run(&self, run_id: impl Into<RunId>, current_step: u64, state: StateBlob) {
        let info = RunInfo {
            current_step,
            status: RunStatus::Executing,
            usage: UsageCounters::default(),
        };
        self.slots
            .write()
            .await
            .insert(run_id.into(), RunSlot { state, info });
    }

    /// Advance a run to a new step with new state
    pub async fn advance(&self, run_id: &RunId, current_step: u64, state: StateBlob) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))?;
        slot.info.current_step = current_step;
        slot.state = state;
        Ok(())
    }

    /// Record usage for a run
    pub async fn record_usage(&self, run_id: &RunId, usage: UsageCounters) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))?;
        slot.info.usage = usage;
        Ok(())
    }

    /// Live state of a run
    pub async fn state(&self, run_id: &RunId) -> Option<StateBlob> {
        self.slots.read().await.get(run_id).map(|s| s.state.clone())
    }

    /// Status of a run
    pub async fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.slots
            .read()
            .await
            .get(run_id)
            .map(|s| s.info.status.clone())
    }
}

#[async_trait]
impl RunExecutor for InMemoryRunExecutor {
    async fn apply_state(&self, run_id: &RunId, state: &StateBlob) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))?;
        slot.state = state.clone();
        Ok(())
    }

    async fn rewind(&self, run_id: &RunId, step_number: u64, state: &StateBlob) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))?;
        slot.state = state.clone();
        slot.info.current_step = step_number;
        Ok(())
    }

    async fn set_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))?;
        slot.info.status = status;
        Ok(())
    }

    async fn run_info(&self, run_id: &RunId) -> Result<RunInfo> {
        self.slots
            .read()
            .await
            .get(run_id)
            .map(|s| s.info.clone())
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))
    }

    async fn capture_state(&self, run_id: &RunId) -> Result<StateBlob> {
        self.state(run_id)
            .await
            .ok_or_else(|| CheckpointError::NotFound(format!("run {}", run_id)))
    }
}
