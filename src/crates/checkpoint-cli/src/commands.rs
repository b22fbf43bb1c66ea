//! Command handlers
//!
//! Every handler writes its report to `out` so the binary can print to stdout and tests can
//! capture the text.

use crate::executor::{validate_run_id, FileRunExecutor};
use anyhow::{bail, Context, Result};
use run_checkpoint::{
    Checkpoint, CheckpointService, CheckpointSettings, Confirmation, DiffKind, RestoreRecord,
    RunId, StateBlob, StorageBackend, Version,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Service, executor and restore journal rooted at the configured data dir
pub struct CliContext {
    pub settings: CheckpointSettings,
    pub executor: FileRunExecutor,
    pub service: CheckpointService,
    journal_dir: PathBuf,
}

impl CliContext {
    pub fn open(mut settings: CheckpointSettings) -> Result<Self> {
        if settings.storage.backend == StorageBackend::Memory {
            warn!("storage.backend = \"memory\" would lose every checkpoint on exit, using the filesystem");
            settings.storage.backend = StorageBackend::Filesystem;
        }

        let data = settings.data_path();
        let executor = FileRunExecutor::new(data.join("runs"));
        let service = CheckpointService::builder(Arc::new(executor.clone()))
            .settings(settings.clone())
            .build()
            .context("failed to set up checkpoint service")?;

        Ok(Self {
            settings,
            executor,
            service,
            journal_dir: data.join("restores"),
        })
    }

    fn journal_path(&self, run_id: &RunId) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.journal_dir.join(format!("{}.jsonl", run_id)))
    }

    /// Persist the audit record of one restore, if it got far enough to have one
    async fn journal_restore(&self, run_id: &RunId, restore_id: Uuid) -> Result<()> {
        let Some(record) = self
            .service
            .restore_history(run_id)
            .await
            .into_iter()
            .find(|r| r.restore_id == restore_id)
        else {
            return Ok(());
        };
        fs::create_dir_all(&self.journal_dir).await?;

        let path = self.journal_path(run_id)?;
        let mut content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context("failed to read restore journal"),
        };
        content.push_str(&serde_json::to_string(&record)?);
        content.push('\n');
        fs::write(&path, content)
            .await
            .context("failed to write restore journal")?;
        Ok(())
    }

    /// Restore records of a run, newest first
    pub async fn journal(&self, run_id: &RunId) -> Result<Vec<RestoreRecord>> {
        let content = match fs::read_to_string(self.journal_path(run_id)?).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("failed to read restore journal"),
        };
        let mut records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<Vec<RestoreRecord>, _>>()
            .context("restore journal is corrupt")?;
        records.reverse();
        Ok(records)
    }
}

/// Parse a state argument: inline JSON, or `@path` to read a file
pub async fn read_state(arg: &str) -> Result<StateBlob> {
    let text = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read state file {}", path))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("state must be valid JSON")
}

pub async fn set_run(
    ctx: &CliContext,
    run_id: &RunId,
    step: u64,
    state: StateBlob,
    out: &mut impl Write,
) -> Result<()> {
    let record = ctx.executor.upsert(run_id, step, state).await?;
    ctx.service.register_run(run_id)?;
    writeln!(out, "Run {} at step {} ({})", run_id, record.current_step, record.status)?;
    Ok(())
}

pub async fn show_run(ctx: &CliContext, run_id: &RunId, out: &mut impl Write) -> Result<()> {
    let record = ctx.executor.load(run_id).await?;
    writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

pub async fn create(
    ctx: &CliContext,
    run_id: &RunId,
    description: Option<String>,
    out: &mut impl Write,
) -> Result<()> {
    let checkpoint = ctx
        .service
        .capture_checkpoint(run_id, description)
        .await?;
    writeln!(out, "Created {} {}", checkpoint.label(), checkpoint.id)?;
    Ok(())
}

fn checkpoint_row(c: &Checkpoint) -> String {
    format!(
        "{:<5} {:<10} {:<7} {:<8} {:<25} {}",
        format!("v{}", c.version),
        c.checkpoint_type.to_string(),
        c.step_number,
        if c.is_valid { "valid" } else { "invalid" },
        c.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        c.description.as_deref().unwrap_or("-"),
    )
}

pub async fn list(
    ctx: &CliContext,
    run_id: &RunId,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<()> {
    let checkpoints = ctx.service.list_checkpoints(run_id).await?;
    if format == OutputFormat::Json {
        writeln!(out, "{}", serde_json::to_string_pretty(&checkpoints)?)?;
        return Ok(());
    }

    if checkpoints.is_empty() {
        writeln!(out, "No checkpoints for run {}", run_id)?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<5} {:<10} {:<7} {:<8} {:<25} {}",
        "Ver", "Type", "Step", "Valid", "Created", "Description"
    )?;
    writeln!(out, "{}", "-".repeat(80))?;
    for checkpoint in &checkpoints {
        writeln!(out, "{}", checkpoint_row(checkpoint))?;
    }
    Ok(())
}

pub async fn show(ctx: &CliContext, checkpoint_id: &str, out: &mut impl Write) -> Result<()> {
    let data = ctx.service.get_checkpoint_data(checkpoint_id).await?;
    writeln!(out, "{}", serde_json::to_string_pretty(&data)?)?;
    Ok(())
}

pub async fn compare(
    ctx: &CliContext,
    id_a: &str,
    id_b: &str,
    show_unchanged: bool,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<()> {
    let comparison = ctx.service.compare_checkpoints(id_a, id_b).await?;
    if format == OutputFormat::Json {
        writeln!(out, "{}", serde_json::to_string_pretty(&comparison)?)?;
        return Ok(());
    }

    writeln!(
        out,
        "{} -> {}: {} changed, {} added, {} removed, {} unchanged",
        comparison.from.label(),
        comparison.to.label(),
        comparison.summary.changed,
        comparison.summary.added,
        comparison.summary.removed,
        comparison.summary.unchanged
    )?;
    for item in &comparison.items {
        let render = |v: &Option<StateBlob>| {
            v.as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default()
        };
        match item.kind {
            DiffKind::Changed => writeln!(
                out,
                "~ {}: {} -> {}",
                item.key,
                render(&item.value_before),
                render(&item.value_after)
            )?,
            DiffKind::Added => writeln!(out, "+ {}: {}", item.key, render(&item.value_after))?,
            DiffKind::Removed => writeln!(out, "- {}: {}", item.key, render(&item.value_before))?,
            DiffKind::Unchanged if show_unchanged => writeln!(out, "  {}", item.key)?,
            DiffKind::Unchanged => {}
        }
    }
    Ok(())
}

/// Request a restore, show what it will do, and go ahead only if `confirm` agrees
pub async fn restore(
    ctx: &CliContext,
    run_id: &RunId,
    version: Version,
    confirm: impl FnOnce() -> Result<bool>,
    out: &mut impl Write,
) -> Result<()> {
    let handle = ctx.service.request_restore(run_id, version).await?;
    writeln!(
        out,
        "Restore run {} to {} (currently at step {})",
        run_id,
        handle.target().label(),
        handle.current_step()
    )?;
    if handle.needs_regression_warning() {
        writeln!(
            out,
            "Warning: {} step(s) of progress will be rolled back and newer checkpoints invalidated",
            handle.steps_to_rollback()
        )?;
    }

    out.flush()?;

    let restore_id = handle.id();
    let confirmation = match confirm() {
        Ok(true) => handle.affirm(),
        Ok(false) => Confirmation::Decline,
        Err(e) => {
            ctx.service.cancel_restore(handle);
            return Err(e);
        }
    };
    let outcome = ctx.service.confirm_restore(handle, confirmation).await;
    ctx.journal_restore(run_id, restore_id).await?;

    let result = outcome?;
    let invalidated = if result.invalidated.is_empty() {
        "none".to_string()
    } else {
        result
            .invalidated
            .iter()
            .map(|v| format!("v{}", v))
            .collect::<Vec<_>>()
            .join(", ")
    };
    writeln!(
        out,
        "Restored to v{}; invalidated: {}",
        result.current_version, invalidated
    )?;
    Ok(())
}

pub async fn history(
    ctx: &CliContext,
    run_id: &RunId,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<()> {
    let records = ctx.journal(run_id).await?;
    if format == OutputFormat::Json {
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }
    if records.is_empty() {
        writeln!(out, "No restores for run {}", run_id)?;
        return Ok(());
    }
    for record in &records {
        let outcome = match &record.outcome {
            run_checkpoint::RestoreOutcome::Completed { invalidated } => {
                format!("completed, {} invalidated", invalidated.len())
            }
            run_checkpoint::RestoreOutcome::Failed { step, reason } => {
                format!("failed at {}: {}", step, reason)
            }
        };
        writeln!(
            out,
            "{}  v{}  rolled back {} step(s)  {}",
            record.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.target_version,
            record.steps_to_rollback,
            outcome
        )?;
    }
    Ok(())
}

pub fn config(ctx: &CliContext, out: &mut impl Write) -> Result<()> {
    writeln!(out, "# data dir: {}", ctx.settings.data_path().display())?;
    write!(out, "{}", toml::to_string_pretty(&ctx.settings)?)?;
    Ok(())
}

/// Take auto checkpoints of a run until `stop` resolves
pub async fn watch(
    ctx: &CliContext,
    run_id: &RunId,
    interval_seconds: u64,
    stop: impl std::future::Future<Output = ()>,
    out: &mut impl Write,
) -> Result<()> {
    // fail early on an unknown run
    ctx.executor.load(run_id).await?;

    let config = ctx
        .service
        .configure_auto_checkpoint(run_id, true, interval_seconds)?;
    writeln!(
        out,
        "Auto-checkpointing run {} every {}s, Ctrl-C to stop",
        run_id, config.interval_seconds
    )?;
    out.flush()?;

    stop.await;
    ctx.service.shutdown().await;

    let taken = ctx
        .service
        .list_checkpoints(run_id)
        .await?
        .into_iter()
        .filter(|c| c.checkpoint_type == run_checkpoint::CheckpointType::Auto)
        .count();
    writeln!(out, "Stopped; run has {} auto checkpoint(s)", taken)?;
    Ok(())
}

/// Parse `--interval` values such as `90`, `90s`, `5m` or `1h`
pub fn parse_interval(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("invalid interval {:?}", value))?;
    let seconds = match unit {
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        other => bail!("unknown interval unit {:?}, use s, m or h", other),
    };
    Ok(seconds.as_secs())
}
