//! Run executor backed by one JSON file per run
//!
//! The CLI does not run agents. It keeps the live state of each run on disk so an operator
//! can seed it, checkpoint it and roll it back between invocations.

use async_trait::async_trait;
use run_checkpoint::{
    CheckpointError, Result, RunExecutor, RunId, RunInfo, RunStatus, StateBlob, UsageCounters,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// What the CLI knows about a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub current_step: u64,
    pub status: RunStatus,
    #[serde(default)]
    pub usage: UsageCounters,
    pub state: StateBlob,
}

/// Run IDs name files, so they are limited to a safe character set
pub fn validate_run_id(run_id: &RunId) -> Result<()> {
    let name = run_id.as_str();
    let safe = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !safe {
        return Err(CheckpointError::Validation(format!(
            "run id {:?} may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileRunExecutor {
    root: PathBuf,
}

impl FileRunExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, run_id: &RunId) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.root.join(format!("{}.json", run_id)))
    }

    pub async fn load(&self, run_id: &RunId) -> Result<RunRecord> {
        let path = self.path_for(run_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::NotFound(format!("run {}", run_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, run_id: &RunId, record: &RunRecord) -> Result<()> {
        let path = self.path_for(run_id)?;
        fs::create_dir_all(&self.root).await?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Create or overwrite a run, leaving it `executing`
    pub async fn upsert(&self, run_id: &RunId, current_step: u64, state: StateBlob) -> Result<RunRecord> {
        let usage = match self.load(run_id).await {
            Ok(existing) => existing.usage,
            Err(CheckpointError::NotFound(_)) => UsageCounters::default(),
            Err(e) => return Err(e),
        };
        let record = RunRecord {
            current_step,
            status: RunStatus::Executing,
            usage,
            state,
        };
        self.save(run_id, &record).await?;
        Ok(record)
    }

    async fn update(&self, run_id: &RunId, change: impl FnOnce(&mut RunRecord)) -> Result<()> {
        let mut record = self.load(run_id).await?;
        change(&mut record);
        self.save(run_id, &record).await
    }
}

#[async_trait]
impl RunExecutor for FileRunExecutor {
    async fn apply_state(&self, run_id: &RunId, state: &StateBlob) -> Result<()> {
        let state = state.clone();
        self.update(run_id, move |record| record.state = state).await
    }

    async fn rewind(&self, run_id: &RunId, step_number: u64, state: &StateBlob) -> Result<()> {
        let state = state.clone();
        self.update(run_id, move |record| {
            record.current_step = step_number;
            record.state = state;
        })
        .await
    }

    async fn set_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        self.update(run_id, move |record| record.status = status).await
    }

    async fn run_info(&self, run_id: &RunId) -> Result<RunInfo> {
        let record = self.load(run_id).await?;
        Ok(RunInfo {
            current_step: record.current_step,
            status: record.status,
            usage: record.usage,
        })
    }

    async fn capture_state(&self, run_id: &RunId) -> Result<StateBlob> {
        Ok(self.load(run_id).await?.state)
    }
}
