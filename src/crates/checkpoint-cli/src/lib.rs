//! # checkpoint-cli
//!
//! Operator front end for run checkpoints. The `checkpointctl` binary keeps runs, checkpoints
//! and a restore journal under the configured data directory:
//!
//! ```text
//! <data_dir>/
//!   runs/<run>.json          live state of each run
//!   ledger/<run>.json        checkpoint metadata
//!   snapshots/<run>/...      state blobs
//!   restores/<run>.jsonl     restore journal
//! ```

pub mod commands;
pub mod executor;

pub use commands::{CliContext, OutputFormat};
pub use executor::{FileRunExecutor, RunRecord};
