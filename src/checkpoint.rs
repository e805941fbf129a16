//! Checkpoint Store
//!
//! Durable record of run progress. The latest checkpoint is authoritative
//! and is replaced atomically (temp file, fsync, rename); every checkpoint is
//! also appended to a per-run history log for auditing.
//!
//! Layout under the checkpoint directory:
//!
//! - `<run_id>.checkpoint.json`: latest checkpoint
//! - `<run_id>.checkpoints.jsonl`: append-only history

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::model::BatchIndex;
use crate::sync::lock;

/// Checkpoint errors. All of them are fatal to a run.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// File I/O failed.
    #[error("checkpoint i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint could not be encoded or decoded.
    #[error("checkpoint json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A checkpoint would move progress backwards.
    #[error("checkpoint regression: batch {attempted} after batch {previous}")]
    Regression {
        previous: BatchIndex,
        attempted: BatchIndex,
    },

    /// Checkpoint belongs to another run.
    #[error("checkpoint run id mismatch: expected {expected}, found {found}")]
    RunMismatch { expected: String, found: String },
}

/// Snapshot of run progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run this checkpoint belongs to.
    pub run_id: String,
    /// Highest batch index such that it and every earlier batch are complete.
    pub last_completed_batch_index: BatchIndex,
    /// Identifiers of every target whose tasks are all terminal.
    pub completed_targets: BTreeSet<String>,
    /// Batches in the run.
    pub total_batches: u64,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
    /// Written once at the end of a run that finished normally.
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

impl Checkpoint {
    /// Checkpoint taken now.
    pub fn new(
        run_id: impl Into<String>,
        last_completed_batch_index: BatchIndex,
        completed_targets: BTreeSet<String>,
        total_batches: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            last_completed_batch_index,
            completed_targets,
            total_batches,
            timestamp: Utc::now(),
            is_final: false,
        }
    }

    /// Mark as the end-of-run checkpoint.
    pub fn with_final(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }

    /// True when `target_id` is recorded complete.
    pub fn is_completed(&self, target_id: &str) -> bool {
        self.completed_targets.contains(target_id)
    }
}

/// Durable checkpoint persistence.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint` as the latest.
    ///
    /// # Errors
    /// `Regression` if its batch index is lower than the last saved one.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Latest checkpoint, or `None` for a fresh run.
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
}

/// File-backed checkpoint store for one run.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    run_id: String,
    last_index: Mutex<Option<BatchIndex>>,
}

impl FileCheckpointStore {
    /// Store for `run_id` under `dir`. The directory is created on first save.
    pub fn new(dir: impl AsRef<Path>, run_id: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            run_id: run_id.into(),
            last_index: Mutex::new(None),
        }
    }

    /// Run id this store serves.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Path of the latest checkpoint.
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", self.run_id))
    }

    /// Path of the history log.
    pub fn history_path(&self) -> PathBuf {
        self.dir.join(format!("{}.checkpoints.jsonl", self.run_id))
    }

    /// Every checkpoint saved for this run, oldest first.
    pub async fn history(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let content = match fs::read_to_string(self.history_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(CheckpointError::from))
            .collect()
    }

    fn check_regression(&self, attempted: BatchIndex) -> Result<(), CheckpointError> {
        let last = lock(&self.last_index);
        match *last {
            Some(previous) if attempted < previous => Err(CheckpointError::Regression {
                previous,
                attempted,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.run_id != self.run_id {
            return Err(CheckpointError::RunMismatch {
                expected: self.run_id.clone(),
                found: checkpoint.run_id.clone(),
            });
        }
        self.check_regression(checkpoint.last_completed_batch_index)?;
        fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_vec(checkpoint)?;
        line.push(b'\n');
        let mut history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .await?;
        history.write_all(&line).await?;
        history.sync_data().await?;

        let latest = self.latest_path();
        let tmp = latest.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&serde_json::to_vec_pretty(checkpoint)?).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &latest).await?;

        *lock(&self.last_index) = Some(checkpoint.last_completed_batch_index);
        tracing::debug!(
            run_id = %self.run_id,
            batch = checkpoint.last_completed_batch_index,
            total = checkpoint.total_batches,
            completed_targets = checkpoint.completed_targets.len(),
            is_final = checkpoint.is_final,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(self.latest_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        if checkpoint.run_id != self.run_id {
            return Err(CheckpointError::RunMismatch {
                expected: self.run_id.clone(),
                found: checkpoint.run_id,
            });
        }

        let mut last = lock(&self.last_index);
        *last = Some(last.unwrap_or(0).max(checkpoint.last_completed_batch_index));
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn targets(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "run-1");
        assert!(store.load().await.unwrap().is_none());
        assert!(store.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp"), "run-1");

        store
            .save(&Checkpoint::new("run-1", 1, targets(&["a", "b"]), 3))
            .await
            .unwrap();
        store
            .save(&Checkpoint::new("run-1", 2, targets(&["a", "b", "c"]), 3))
            .await
            .unwrap();

        let loaded = FileCheckpointStore::new(dir.path().join("cp"), "run-1")
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_completed_batch_index, 2);
        assert!(loaded.is_completed("c"));
        assert!(!loaded.is_final);

        let history = store.history().await.unwrap();
        assert_eq!(
            history
                .iter()
                .map(|c| c.last_completed_batch_index)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(!store.latest_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_regression_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "run-1");
        store
            .save(&Checkpoint::new("run-1", 3, BTreeSet::new(), 5))
            .await
            .unwrap();

        let err = store
            .save(&Checkpoint::new("run-1", 2, BTreeSet::new(), 5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Regression {
                previous: 3,
                attempted: 2
            }
        ));

        // Same index (e.g. the final checkpoint) is allowed.
        store
            .save(&Checkpoint::new("run-1", 3, BTreeSet::new(), 5).with_final(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_regression_checked_after_load() {
        let dir = tempdir().unwrap();
        FileCheckpointStore::new(dir.path(), "run-1")
            .save(&Checkpoint::new("run-1", 4, BTreeSet::new(), 5))
            .await
            .unwrap();

        let resumed = FileCheckpointStore::new(dir.path(), "run-1");
        resumed.load().await.unwrap();
        assert!(
            resumed
                .save(&Checkpoint::new("run-1", 1, BTreeSet::new(), 5))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_run_id_mismatch() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "run-1");
        let err = store
            .save(&Checkpoint::new("run-2", 1, BTreeSet::new(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::RunMismatch { .. }));

        // A latest file copied from another run is rejected on load.
        store
            .save(&Checkpoint::new("run-1", 1, BTreeSet::new(), 1))
            .await
            .unwrap();
        std::fs::copy(
            store.latest_path(),
            dir.path().join("run-3.checkpoint.json"),
        )
        .unwrap();
        let other = FileCheckpointStore::new(dir.path(), "run-3");
        assert!(matches!(
            other.load().await,
            Err(CheckpointError::RunMismatch { .. })
        ));
    }

    #[test]
    fn test_final_field_name() {
        let cp = Checkpoint::new("r", 1, BTreeSet::new(), 1).with_final(true);
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["final"], true);
        assert!(json.get("is_final").is_none());
    }
}
