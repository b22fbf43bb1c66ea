//! Filesystem backends
//!
//! Layout under a data directory:
//!
//! ```text
//! <root>/snapshots/<run>/v<version>-<id>.json   one blob per checkpoint, never rewritten
//! <root>/ledger/<run>.json                      every checkpoint record of the run
//! <root>/ledger/<run>.lock                      advisory lock shared by every process
//! ```
//!
//! Snapshot blobs are published with a hard link from a temporary file, so a blob is either
//! complete or absent and an existing key is never overwritten. Ledger files are rewritten
//! through a temporary file followed by a rename.
//!
//! Several processes may work on one data directory (a `watch` next to a `restore`). The
//! ledger store hands out an exclusive `flock` on `<run>.lock` as its run lease, and the
//! ledger holds it across the whole create or restore, so read-modify-write of a run file
//! never interleaves between processes.

use crate::{
    checkpoint::{Checkpoint, RunId, StateBlob, Version},
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{LedgerStore, SnapshotStore, StoreLease},
};
use async_trait::async_trait;
use fs2::FileExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Percent-encode anything outside `[A-Za-z0-9._-]` so a key segment is a safe file name.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            // a leading dot would allow "." and ".."
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    if out.is_empty() {
        out.push_str("%00");
    }
    out
}

fn decode_segment(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            let byte = u8::from_str_radix(hex, 16).ok()?;
            if byte != 0 {
                out.push(byte);
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    target.with_file_name(name)
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Snapshot blobs as files, one per key
#[derive(Debug, Clone)]
pub struct FsSnapshotStore<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
}

impl FsSnapshotStore<JsonSerializer> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, JsonSerializer)
    }
}

impl<S: SerializerProtocol> FsSnapshotStore<S> {
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            root: root.into(),
            serializer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for a snapshot key; `/` in the key becomes a directory boundary.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let segments: Vec<&str> = key.split('/').collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let encoded = encode_segment(segment);
            if i == last {
                path.push(format!("{}.{}", encoded, self.serializer.extension()));
            } else {
                path.push(encoded);
            }
        }
        path
    }
}

#[async_trait]
impl<S: SerializerProtocol> SnapshotStore for FsSnapshotStore<S> {
    async fn put(&self, key: &str, blob: &StateBlob) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckpointError::persistence("creating snapshot directory", e))?;
        }

        let bytes = self.serializer.dumps(blob)?;
        let tmp = tmp_path(&path);
        if let Err(e) = write_new_file(&tmp, &bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CheckpointError::persistence("writing snapshot", e));
        }

        let published = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match published {
            Ok(()) => {
                debug!(key, path = %path.display(), "Snapshot written");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CheckpointError::Persistence(
                format!("snapshot {} already exists", key),
            )),
            Err(e) => Err(CheckpointError::persistence("publishing snapshot", e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<StateBlob>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(self.serializer.loads(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::persistence("reading snapshot", e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| CheckpointError::persistence("checking snapshot", e))
    }
}

/// How often a waiting process retries a held run lease
const LEASE_POLL: Duration = Duration::from_millis(10);

/// An exclusive `flock` on a run's lock file. Unlocked on drop.
#[derive(Debug)]
struct RunFileLock(std::fs::File);

impl Drop for RunFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Checkpoint records as one file per run
#[derive(Debug)]
pub struct FsLedgerStore<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
    // serializes read-modify-write of run files within this process; across processes the
    // ledger holds the run lease
    write_lock: Mutex<()>,
}

impl FsLedgerStore<JsonSerializer> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, JsonSerializer)
    }
}

impl<S: SerializerProtocol> FsLedgerStore<S> {
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            root: root.into(),
            serializer,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join(format!(
            "{}.{}",
            encode_segment(run_id.as_str()),
            self.serializer.extension()
        ))
    }

    fn lock_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join(format!("{}.lock", encode_segment(run_id.as_str())))
    }

    fn try_lock_file(&self, run_id: &RunId) -> Result<RunFileLock> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| CheckpointError::persistence("creating ledger directory", e))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(run_id))
            .map_err(|e| CheckpointError::persistence("opening run lock", e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(RunFileLock(file)),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(CheckpointError::Concurrency {
                    run_id: run_id.clone(),
                })
            }
            Err(e) => Err(CheckpointError::persistence("locking run", e)),
        }
    }

    async fn read_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        match fs::read(self.run_path(run_id)).await {
            Ok(bytes) => self.serializer.loads(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CheckpointError::persistence("reading ledger", e)),
        }
    }

    async fn write_run(&self, run_id: &RunId, entries: &[Checkpoint]) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CheckpointError::persistence("creating ledger directory", e))?;

        let path = self.run_path(run_id);
        let tmp = tmp_path(&path);
        let bytes = self.serializer.dumps(&entries)?;

        if let Err(e) = write_new_file(&tmp, &bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CheckpointError::persistence("writing ledger", e));
        }
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::persistence("replacing ledger", e))
    }
}

#[async_trait]
impl<S: SerializerProtocol> LedgerStore for FsLedgerStore<S> {
    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        self.read_run(run_id).await
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut entries = self.read_run(&checkpoint.run_id).await?;

        let expected = entries.last().map(|c| c.version + 1).unwrap_or(1);
        if checkpoint.version != expected {
            return Err(CheckpointError::Persistence(format!(
                "refusing out-of-order append: got v{}, expected v{}",
                checkpoint.version, expected
            )));
        }

        entries.push(checkpoint.clone());
        self.write_run(&checkpoint.run_id, &entries).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Checkpoint>> {
        for run_id in self.runs().await? {
            let entries = self.read_run(&run_id).await?;
            if let Some(found) = entries.into_iter().find(|c| c.id == id) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn mark_invalid_above(&self, run_id: &RunId, above: Version) -> Result<Vec<Version>> {
        let _write = self.write_lock.lock().await;
        let mut entries = self.read_run(run_id).await?;

        let mut flipped = Vec::new();
        for entry in entries.iter_mut().filter(|c| c.version > above && c.is_valid) {
            entry.is_valid = false;
            flipped.push(entry.version);
        }

        if !flipped.is_empty() {
            self.write_run(run_id, &entries).await?;
        }
        Ok(flipped)
    }

    async fn runs(&self) -> Result<Vec<RunId>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::persistence("listing ledger", e)),
        };

        let suffix = format!(".{}", self.serializer.extension());
        let mut runs = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CheckpointError::persistence("listing ledger", e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // temp files end in ".tmp" and are skipped here
            if let Some(stem) = name.strip_suffix(suffix.as_str()) {
                if let Some(run) = decode_segment(stem) {
                    runs.push(RunId::new(run));
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    async fn lease_run(&self, run_id: &RunId, timeout: Duration) -> Result<Option<StoreLease>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_lock_file(run_id) {
                Ok(lock) => return Ok(Some(Box::new(lock) as StoreLease)),
                Err(CheckpointError::Concurrency { .. })
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(LEASE_POLL).await;
                }
                Err(e) => {
                    if matches!(e, CheckpointError::Concurrency { .. }) {
                        debug!(run_id = %run_id, ?timeout, "Timed out waiting for run lease");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn try_lease_run(&self, run_id: &RunId) -> Result<Option<StoreLease>> {
        self.try_lock_file(run_id)
            .map(|lock| Some(Box::new(lock) as StoreLease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointType;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(run: &str, version: Version) -> Checkpoint {
        let id = format!("{}-{}", run, version);
        Checkpoint {
            snapshot_ref: Checkpoint::snapshot_key(&run.into(), version, &id),
            id,
            run_id: run.into(),
            version,
            step_number: version * 5,
            checkpoint_type: CheckpointType::Manual,
            description: None,
            created_at: Utc::now(),
            tokens_used: 0,
            execution_time_ms: 0,
            is_valid: true,
        }
    }

    #[test]
    fn test_segment_encoding() {
        assert_eq!(encode_segment("run-42"), "run-42");
        assert_eq!(encode_segment(".."), "%2E.");
        assert_eq!(encode_segment("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_segment(""), "%00");

        for raw in ["run-42", "..", "a b", "ünï", ""] {
            assert_eq!(decode_segment(&encode_segment(raw)).as_deref(), Some(raw));
        }
    }

    #[test]
    fn test_snapshot_path_stays_under_root() {
        let store = FsSnapshotStore::new("/data/snapshots");
        let path = store.path_for("../escape/v1-x");
        assert!(path.starts_with("/data/snapshots"));
        assert!(path.ends_with("%2E./escape/v1-x.json"));
    }

    #[tokio::test]
    async fn test_snapshot_put_get_and_no_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        let blob = json!({"messages": ["a", "b"], "n": 1});

        store.put("run-1/v1-abc", &blob).await.unwrap();
        assert_eq!(store.get("run-1/v1-abc").await.unwrap(), Some(blob.clone()));
        assert!(store.exists("run-1/v1-abc").await.unwrap());

        let err = store.put("run-1/v1-abc", &json!({"other": true})).await;
        assert!(matches!(err, Err(CheckpointError::Persistence(_))));
        assert_eq!(store.get("run-1/v1-abc").await.unwrap(), Some(blob));

        assert_eq!(store.get("run-1/v2-missing").await.unwrap(), None);
        assert!(!store.exists("run-1/v2-missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_ledger_append_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = FsLedgerStore::new(dir.path());

        for version in 1..=3 {
            store.append(&record("run-1", version)).await.unwrap();
        }
        store.append(&record("run 2", 1)).await.unwrap();

        let reopened = FsLedgerStore::new(dir.path());
        let versions: Vec<Version> = reopened
            .load_run(&"run-1".into())
            .await
            .unwrap()
            .iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(
            reopened.runs().await.unwrap(),
            vec![RunId::from("run 2"), RunId::from("run-1")]
        );
        assert_eq!(
            reopened.find_by_id("run-1-2").await.unwrap().map(|c| c.version),
            Some(2)
        );
        assert!(reopened.find_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ledger_rejects_gaps() {
        let dir = TempDir::new().unwrap();
        let store = FsLedgerStore::new(dir.path());

        store.append(&record("run-1", 1)).await.unwrap();
        let err = store.append(&record("run-1", 3)).await;
        assert!(matches!(err, Err(CheckpointError::Persistence(_))));
        assert_eq!(store.load_run(&"run-1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_invalidation_persists() {
        let dir = TempDir::new().unwrap();
        let store = FsLedgerStore::new(dir.path());
        for version in 1..=4 {
            store.append(&record("run-1", version)).await.unwrap();
        }

        let run: RunId = "run-1".into();
        assert_eq!(store.mark_invalid_above(&run, 2).await.unwrap(), vec![3, 4]);
        assert!(store.mark_invalid_above(&run, 2).await.unwrap().is_empty());

        let validity: Vec<bool> = FsLedgerStore::new(dir.path())
            .load_run(&run)
            .await
            .unwrap()
            .iter()
            .map(|c| c.is_valid)
            .collect();
        assert_eq!(validity, vec![true, true, false, false]);
    }

    #[tokio::test]
    async fn test_run_lease_is_exclusive_across_stores() {
        let dir = TempDir::new().unwrap();
        let ours = FsLedgerStore::new(dir.path());
        let theirs = FsLedgerStore::new(dir.path());
        let run: RunId = "run-1".into();

        let lease = ours.try_lease_run(&run).unwrap();
        assert!(lease.is_some());
        assert!(matches!(
            theirs.try_lease_run(&run),
            Err(CheckpointError::Concurrency { .. })
        ));
        assert!(matches!(
            theirs.lease_run(&run, Duration::from_millis(30)).await,
            Err(CheckpointError::Concurrency { .. })
        ));
        // other runs are not affected
        assert!(theirs.try_lease_run(&"run-2".into()).is_ok());

        drop(lease);
        assert!(theirs
            .lease_run(&run, Duration::from_millis(30))
            .await
            .unwrap()
            .is_some());
        // lock files are not mistaken for runs
        assert!(theirs.runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_means_no_runs() {
        let dir = TempDir::new().unwrap();
        let store = FsLedgerStore::new(dir.path().join("not-created"));
        assert!(store.runs().await.unwrap().is_empty());
        assert!(store.load_run(&"run-1".into()).await.unwrap().is_empty());
    }
}
