//! Core checkpoint data structures
//!
//! This module defines the metadata record the ledger keeps for every snapshot of a run:
//! **[`Checkpoint`]**, plus the identifiers and small value types around it.
//!
//! # Overview
//!
//! - **Versioned** - every checkpoint carries a per-run `version` starting at 1, gapless
//! - **Immutable** - the only field that ever changes is `is_valid`, and only from `true` to `false`
//! - **Opaque state** - the run state itself lives in the snapshot store under `snapshot_ref`
//! - **Serializable** - all types round-trip through serde for persistence and listing
//!
//! # Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Checkpoint                                  │
//! │  • id: "uuid-abc"                            │
//! │  • run_id: "run-42"                          │
//! │  • version: 3                                │
//! │  • step_number: 15                           │
//! │  • checkpoint_type: manual                   │
//! │  • description: "post review"                │
//! │  • created_at: 2024-01-01T12:00:00Z          │
//! │  • tokens_used / execution_time_ms           │
//! │  • is_valid: true                            │
//! │  • snapshot_ref: "run-42/v3-uuid-abc"  ──────┼──▶ SnapshotStore
//! └──────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Per-run checkpoint version, starting at 1
pub type Version = u64;

/// Opaque run state captured by a checkpoint
pub type StateBlob = serde_json::Value;

/// Identifier of the run being checkpointed. Owned by the run executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a checkpoint came to be
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Requested by a user
    Manual,
    /// Taken by the auto-checkpoint scheduler
    Auto,
    /// Taken right before a tool call
    PreTool,
    /// Taken after a run step finished
    PostStep,
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::PreTool => "pre_tool",
            Self::PostStep => "post_step",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "pre_tool" => Ok(Self::PreTool),
            "post_step" => Ok(Self::PostStep),
            other => Err(format!("unknown checkpoint type: {}", other)),
        }
    }
}

/// Usage counters captured at creation time
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounters {
    pub tokens_used: u64,
    pub execution_time_ms: u64,
}

/// Immutable checkpoint metadata record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Unique checkpoint ID
    pub id: CheckpointId,

    /// Owning run
    pub run_id: RunId,

    /// Position in the run's history (1, 2, 3, ... with no gaps)
    pub version: Version,

    /// The run's step when the checkpoint was taken
    pub step_number: u64,

    pub checkpoint_type: CheckpointType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Non-decreasing within a run
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub tokens_used: u64,

    #[serde(default)]
    pub execution_time_ms: u64,

    /// Flipped to false by a restore to an older version, never back
    pub is_valid: bool,

    /// Key of the state blob in the snapshot store
    pub snapshot_ref: String,
}

impl Checkpoint {
    /// Snapshot key for a new checkpoint. Each checkpoint gets its own key so
    /// blobs are never overwritten.
    pub fn snapshot_key(run_id: &RunId, version: Version, id: &str) -> String {
        format!("{}/v{}-{}", run_id, version, id)
    }

    pub(crate) fn new_id() -> CheckpointId {
        Uuid::new_v4().to_string()
    }

    /// Usage counters as a struct
    pub fn usage(&self) -> UsageCounters {
        UsageCounters {
            tokens_used: self.tokens_used,
            execution_time_ms: self.execution_time_ms,
        }
    }

    /// Short label used in logs and the CLI, e.g. `v3 (manual, step 15)`
    pub fn label(&self) -> String {
        format!(
            "v{} ({}, step {})",
            self.version, self.checkpoint_type, self.step_number
        )
    }
}

/// Parameters for creating a checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub run_id: RunId,
    pub step_number: u64,
    pub checkpoint_type: CheckpointType,
    pub description: Option<String>,
    pub usage: UsageCounters,
    pub state: StateBlob,
}

impl CheckpointRequest {
    /// Create a new checkpoint request
    pub fn new(
        run_id: impl Into<RunId>,
        step_number: u64,
        checkpoint_type: CheckpointType,
        state: StateBlob,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_number,
            checkpoint_type,
            description: None,
            usage: UsageCounters::default(),
            state,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the usage counters
    pub fn with_usage(mut self, usage: UsageCounters) -> Self {
        self.usage = usage;
        self
    }
}

/// Run status as reported to the run executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Executing,
    Paused,
    Resuming,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the run executor reports about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub current_step: u64,
    pub status: RunStatus,
    #[serde(default)]
    pub usage: UsageCounters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_type_serde_names() {
        assert_eq!(
            serde_json::to_value(CheckpointType::PreTool).unwrap(),
            json!("pre_tool")
        );
        assert_eq!(
            "post_step".parse::<CheckpointType>().unwrap(),
            CheckpointType::PostStep
        );
        assert!("weekly".parse::<CheckpointType>().is_err());
    }

    #[test]
    fn test_checkpoint_request_builder() {
        let request = CheckpointRequest::new("run-1", 10, CheckpointType::Manual, json!({"a": 1}))
            .with_description("before tool")
            .with_usage(UsageCounters {
                tokens_used: 120,
                execution_time_ms: 900,
            });

        assert_eq!(request.run_id, RunId::from("run-1"));
        assert_eq!(request.description.as_deref(), Some("before tool"));
        assert_eq!(request.usage.tokens_used, 120);
    }

    #[test]
    fn test_snapshot_key_is_unique_per_checkpoint() {
        let run = RunId::from("run-1");
        let a = Checkpoint::snapshot_key(&run, 1, "x");
        let b = Checkpoint::snapshot_key(&run, 1, "y");
        assert_ne!(a, b);
        assert!(a.starts_with("run-1/v1-"));
    }

    #[test]
    fn test_checkpoint_metadata_serializes() {
        let checkpoint = Checkpoint {
            id: "cp-1".to_string(),
            run_id: "run-1".into(),
            version: 1,
            step_number: 10,
            checkpoint_type: CheckpointType::Manual,
            description: None,
            created_at: Utc::now(),
            tokens_used: 5,
            execution_time_ms: 7,
            is_valid: true,
            snapshot_ref: "run-1/v1-cp-1".to_string(),
        };

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["run_id"], json!("run-1"));
        assert!(value.get("description").is_none());

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
    }
}
