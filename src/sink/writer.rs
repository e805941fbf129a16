//! Result records and their on-disk writers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::aggregate::ErrorClass;
use crate::model::{BatchIndex, TaskOutcome, TaskResult, TaskStatus};
use crate::sink::SinkError;

/// One persisted result line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub target: String,
    pub collector: String,
    pub batch: BatchIndex,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<&TaskResult> for ResultRecord {
    fn from(r: &TaskResult) -> Self {
        let (payload, degraded_reason, error_class, message) = match &r.outcome {
            TaskOutcome::Success { payload, .. } => (Some(payload.clone()), None, None, None),
            TaskOutcome::PartialSuccess {
                payload,
                degraded_reason,
                ..
            } => (
                Some(payload.clone()),
                Some(degraded_reason.clone()),
                None,
                None,
            ),
            TaskOutcome::Failure { class, message, .. } => {
                (None, None, Some(*class), Some(message.clone()))
            }
        };

        Self {
            task_id: r.task_id.to_string(),
            target: r.target.id().to_owned(),
            collector: r.collector.clone(),
            batch: r.batch,
            status: r.status(),
            payload,
            degraded_reason,
            error_class,
            message,
            attempts: r.attempts,
            elapsed_ms: r.outcome.elapsed().as_millis().min(u64::MAX as u128) as u64,
            timestamp: r.finished_at,
        }
    }
}

/// Destination for flushed record batches.
#[async_trait::async_trait]
pub trait ResultWriter: Send + 'static {
    /// Append `records` in order.
    async fn write_batch(&mut self, records: &[ResultRecord]) -> Result<(), SinkError>;

    /// Make everything written so far durable.
    async fn finish(&mut self) -> Result<(), SinkError>;

    /// Human-readable output location.
    fn location(&self) -> String;
}

/// Appends JSON Lines to a file.
#[derive(Debug)]
pub struct JsonLinesWriter {
    path: PathBuf,
    file: File,
    line_buf: Vec<u8>,
}

impl JsonLinesWriter {
    /// Open `path` for appending, creating it and its parent directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            line_buf: Vec::new(),
        })
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ResultWriter for JsonLinesWriter {
    async fn write_batch(&mut self, records: &[ResultRecord]) -> Result<(), SinkError> {
        self.line_buf.clear();
        for record in records {
            serde_json::to_writer(&mut self.line_buf, record)?;
            self.line_buf.push(b'\n');
        }
        self.file.write_all(&self.line_buf).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskId, Target};
    use std::time::Duration;

    fn failure_result() -> TaskResult {
        let target = Target::new("db01");
        TaskResult {
            task_id: TaskId::new(2, &target, "pkgs"),
            target,
            collector: "pkgs".into(),
            critical: false,
            batch: 2,
            attempts: 3,
            outcome: TaskOutcome::Failure {
                class: ErrorClass::Timeout,
                message: "timed out".into(),
                elapsed: Duration::from_millis(1500),
            },
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_from_failure() {
        let record = ResultRecord::from(&failure_result());
        assert_eq!(record.task_id, "b2/db01/pkgs");
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(record.error_class, Some(ErrorClass::Timeout));
        assert_eq!(record.elapsed_ms, 1500);
        assert!(record.payload.is_none());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["error_class"], "timeout");
        assert_eq!(json["status"], "failure");
        assert!(json.get("payload").is_none());
    }

    #[tokio::test]
    async fn test_json_lines_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");
        let record = ResultRecord::from(&failure_result());

        let mut writer = JsonLinesWriter::open(&path).await.unwrap();
        writer.write_batch(&[record.clone(), record.clone()]).await.unwrap();
        writer.finish().await.unwrap();
        drop(writer);

        let mut writer = JsonLinesWriter::open(&path).await.unwrap();
        writer.write_batch(std::slice::from_ref(&record)).await.unwrap();
        writer.finish().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<ResultRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], record);
    }
}
