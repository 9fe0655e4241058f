//! Durable, append-only record of which papers have been attempted.
//!
//! The log is one JSON object per line:
//!
//! ```text
//! {"arxiv_id":"2101.00001v2","status":"succeeded","timestamp":"2026-10-14T08:00:00Z","duration_ms":81234,"images":4}
//! {"arxiv_id":"2101.00002v1","status":"timed_out","timestamp":"2026-10-14T08:04:01Z","error":"2101.00002v1: conversion timed out after 240s"}
//! ```
//!
//! Status is never held only in memory: [`CheckpointStore::open`] rebuilds the
//! latest-status-per-id view by replaying the log, so a crash at any point
//! leaves a consistent record to resume from. Each line parses on its own; a
//! garbled line is skipped and counted, not fatal.

use crate::error::ArxivError;
use crate::output::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One line of the checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub arxiv_id: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<usize>,
}

/// Optional details attached to a record.
#[derive(Debug, Clone, Default)]
pub struct RecordMetadata {
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub images: Option<usize>,
}

impl RecordMetadata {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Default::default()
        }
    }
}

/// Append-only checkpoint log plus its derived "latest status per id" view.
///
/// Single writer: only the batch driver calls [`record`](Self::record).
pub struct CheckpointStore {
    path: PathBuf,
    file: tokio::fs::File,
    latest: HashMap<String, JobStatus>,
    corrupt_lines: usize,
}

impl CheckpointStore {
    /// Open (or create) the log at `path` and replay it.
    ///
    /// Blocking; call it before the download stream starts.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArxivError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| ArxivError::CheckpointOpen {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(open_err)?;
        }

        let mut raw = Vec::new();
        if path.exists() {
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut raw))
                .map_err(open_err)?;
        }

        let (latest, corrupt_lines) = replay(&raw);
        if corrupt_lines > 0 {
            warn!(
                "Checkpoint {}: skipped {} unparseable line(s)",
                path.display(),
                corrupt_lines
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        // A crash mid-append can leave a partial last line; terminate it so the
        // next record starts on a fresh line instead of being glued to garbage.
        if raw.last().is_some_and(|b| *b != b'\n') {
            file.write_all(b"\n").map_err(open_err)?;
        }

        if !latest.is_empty() {
            let done = latest.values().filter(|s| **s == JobStatus::Succeeded).count();
            info!(
                "Resuming from checkpoint with {} recorded papers ({} succeeded)",
                latest.len(),
                done
            );
        }

        Ok(Self {
            path,
            file: tokio::fs::File::from_std(file),
            latest,
            corrupt_lines,
        })
    }

    /// A store whose every append fails, for exercising write errors.
    #[cfg(test)]
    pub(crate) fn unwritable(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        fs::write(&path, b"").unwrap();
        let file = File::open(&path).unwrap();
        Self {
            path,
            file: tokio::fs::File::from_std(file),
            latest: HashMap::new(),
            corrupt_lines: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True only when the latest recorded status is `succeeded`.
    pub fn is_done(&self, arxiv_id: &str) -> bool {
        self.latest.get(arxiv_id) == Some(&JobStatus::Succeeded)
    }

    /// Latest recorded status, if any.
    pub fn status(&self, arxiv_id: &str) -> Option<JobStatus> {
        self.latest.get(arxiv_id).copied()
    }

    /// Number of distinct identifiers in the log.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Lines skipped during replay because they did not parse.
    pub fn corrupt_lines(&self) -> usize {
        self.corrupt_lines
    }

    /// Identifiers whose latest status is `succeeded`, sorted.
    pub fn succeeded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .latest
            .iter()
            .filter(|(_, s)| **s == JobStatus::Succeeded)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Append one record and flush it to disk.
    ///
    /// The in-memory view is only updated once the line is durable.
    pub async fn record(
        &mut self,
        arxiv_id: &str,
        status: JobStatus,
        metadata: RecordMetadata,
    ) -> Result<(), ArxivError> {
        let record = CheckpointRecord {
            arxiv_id: arxiv_id.to_string(),
            status,
            timestamp: Utc::now(),
            error: metadata.error,
            duration_ms: metadata.duration_ms,
            images: metadata.images,
        };

        let write_err = |source| ArxivError::CheckpointWrite {
            arxiv_id: arxiv_id.to_string(),
            path: self.path.clone(),
            source,
        };

        let mut line = serde_json::to_vec(&record).map_err(|e| write_err(e.into()))?;
        line.push(b'\n');
        self.file.write_all(&line).await.map_err(write_err)?;
        self.file.flush().await.map_err(write_err)?;
        self.file.sync_data().await.map_err(write_err)?;

        debug!("Checkpoint: {} → {}", arxiv_id, status);
        self.latest.insert(record.arxiv_id, status);
        Ok(())
    }
}

/// Parse every line independently; later lines win.
fn replay(raw: &[u8]) -> (HashMap<String, JobStatus>, usize) {
    let mut latest = HashMap::new();
    let mut corrupt = 0usize;

    for (lineno, line) in raw.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<CheckpointRecord>(line) {
            Ok(rec) => {
                latest.insert(rec.arxiv_id, rec.status);
            }
            Err(e) => {
                debug!("Checkpoint line {} unparseable: {}", lineno + 1, e);
                corrupt += 1;
            }
        }
    }

    (latest, corrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path().join("checkpoints/arxiv_2101.checkpoint")).unwrap()
    }

    #[tokio::test]
    async fn record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = store_in(&dir);
            store
                .record("2101.00001v1", JobStatus::Succeeded, RecordMetadata::default())
                .await
                .unwrap();
            store
                .record(
                    "2101.00002v1",
                    JobStatus::TimedOut,
                    RecordMetadata::error("timed out"),
                )
                .await
                .unwrap();
        }

        let store = store_in(&dir);
        assert_eq!(store.len(), 2);
        assert!(store.is_done("2101.00001v1"));
        assert!(!store.is_done("2101.00002v1"));
        assert_eq!(store.status("2101.00002v1"), Some(JobStatus::TimedOut));
        assert!(!store.is_done("2101.99999v1"));
    }

    #[tokio::test]
    async fn latest_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = store_in(&dir);
            store
                .record("a", JobStatus::Failed, RecordMetadata::error("boom"))
                .await
                .unwrap();
            store
                .record("a", JobStatus::Succeeded, RecordMetadata::default())
                .await
                .unwrap();
        }
        let store = store_in(&dir);
        assert!(store.is_done("a"));
        assert_eq!(store.succeeded_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn corrupt_line_does_not_hide_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arxiv_2101.checkpoint");
        let mut content = Vec::new();
        content.extend_from_slice(
            br#"{"arxiv_id":"before","status":"succeeded","timestamp":"2026-10-14T08:00:00Z"}"#,
        );
        content.extend_from_slice(b"\n{\"arxiv_id\":\"trunc\",\"sta\xff\xfe\n");
        content.extend_from_slice(
            br#"{"arxiv_id":"after","status":"failed","timestamp":"2026-10-14T08:01:00Z","error":"x"}"#,
        );
        content.push(b'\n');
        fs::write(&path, content).unwrap();

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.corrupt_lines(), 1);
        assert!(store.is_done("before"));
        assert_eq!(store.status("after"), Some(JobStatus::Failed));
        assert_eq!(store.status("trunc"), None);
    }

    #[tokio::test]
    async fn partial_last_line_is_terminated_before_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arxiv_2101.checkpoint");
        fs::write(&path, br#"{"arxiv_id":"half","status":"succ"#).unwrap();

        {
            let mut store = CheckpointStore::open(&path).unwrap();
            assert_eq!(store.corrupt_lines(), 1);
            store
                .record("next", JobStatus::Succeeded, RecordMetadata::default())
                .await
                .unwrap();
        }

        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.is_done("next"));
        assert_eq!(store.corrupt_lines(), 1);
    }

    #[tokio::test]
    async fn metadata_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store
            .record(
                "2101.00003v2",
                JobStatus::Succeeded,
                RecordMetadata {
                    duration_ms: Some(1234),
                    images: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        let rec: CheckpointRecord = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(rec.arxiv_id, "2101.00003v2");
        assert_eq!(rec.duration_ms, Some(1234));
        assert_eq!(rec.images, Some(3));
        assert!(rec.error.is_none());
        assert!(!text.contains("\"error\""));
    }

    #[tokio::test]
    async fn failed_append_leaves_view_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::unwritable(dir.path().join("ro.checkpoint"));
        let err = store
            .record("2101.00004v1", JobStatus::Succeeded, RecordMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ArxivError::CheckpointWrite { .. }));
        assert!(!store.is_done("2101.00004v1"));
        assert!(store.is_empty());
    }
}
