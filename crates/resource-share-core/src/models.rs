//! Core data models for the upload engine.
//!
//! [`UploadTask`] is the record tracked for one resumable upload attempt.
//! All status changes go through [`UploadTask::transition`], which consults
//! [`TaskStatus::can_transition_to`] so illegal moves are rejected in one
//! place instead of at every call site.
//!
//! ```text
//! pending ──▶ uploading ──▶ merging ──▶ processing ──▶ completed
//!    │           │  ▲          │            │
//!    │           └──┘          │            │
//!    └───────────┴─────────────┴────────────┴──────▶ failed
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{UploadError, UploadResult};

/// Progress checkpoint recorded once all chunks are merged.
pub const MERGED_PROGRESS: u8 = 75;

/// Progress checkpoint recorded right before the resource is registered.
pub const FINALIZING_PROGRESS: u8 = 90;

/// Lifecycle status of an [`UploadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created by `init`, no chunk received yet.
    Pending,
    /// At least one chunk received.
    Uploading,
    /// Client signalled completion; chunks are being concatenated.
    Merging,
    /// Merged file exists; classification and resource registration.
    Processing,
    /// Resource registered. Terminal.
    Completed,
    /// Gave up with an error message. Terminal.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Uploading,
        TaskStatus::Merging,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Merging => "merging",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses the pipeline resumes after a restart.
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Merging | TaskStatus::Processing)
    }

    /// The authoritative transition table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Uploading)
            | (Uploading, Uploading)
            | (Uploading, Merging)
            | (Merging, Processing)
            | (Processing, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UploadError::InvalidRequest(format!("unknown task status: '{}'", s)))
    }
}

/// Current time truncated to milliseconds, the precision tasks are persisted with.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Splits a declared size into `(chunk_size, total_chunks)`.
///
/// A `max_chunk_size` of zero (or one at least as large as the file) yields a
/// single chunk sized to the whole file.
pub fn plan_chunks(file_size: u64, max_chunk_size: u64) -> UploadResult<(u64, u32)> {
    if file_size == 0 {
        return Err(UploadError::InvalidRequest(
            "file_size must be > 0".to_string(),
        ));
    }
    if max_chunk_size == 0 || max_chunk_size >= file_size {
        return Ok((file_size, 1));
    }
    let total = file_size.div_ceil(max_chunk_size);
    let total = u32::try_from(total).map_err(|_| {
        UploadError::InvalidRequest(format!("file_size {} needs too many chunks", file_size))
    })?;
    Ok((max_chunk_size, total))
}

/// One resumable upload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: String,
    pub owner_id: i64,
    /// Client-declared name; only its extension is trusted for classification.
    pub file_name: String,
    /// Client-declared total size in bytes.
    pub file_size: u64,
    pub description: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub file_path: Option<String>,
    pub category: Option<String>,
    pub resource_id: Option<i64>,
    /// Set before the resource insert so a replayed finalize looks the
    /// resource up instead of inserting it twice.
    pub finalize_attempted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    /// Creates a `pending` task with a fresh id.
    pub fn new(
        owner_id: i64,
        file_name: impl Into<String>,
        file_size: u64,
        description: Option<String>,
        max_chunk_size: u64,
    ) -> UploadResult<Self> {
        let file_name = file_name.into();
        if file_name.trim().is_empty() {
            return Err(UploadError::InvalidRequest(
                "file_name must not be empty".to_string(),
            ));
        }
        let (chunk_size, total_chunks) = plan_chunks(file_size, max_chunk_size)?;
        let created_at = now();

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            file_name,
            file_size,
            description,
            chunk_size,
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            file_path: None,
            category: None,
            resource_id: None,
            finalize_attempted: false,
            created_at,
            updated_at: created_at,
        })
    }

    /// Moves to `next` if the transition table allows it.
    pub fn transition(&mut self, next: TaskStatus) -> UploadResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now();
        Ok(())
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.uploaded_chunks.contains(&index)
    }

    pub fn is_fully_received(&self) -> bool {
        self.uploaded_chunks.len() == self.total_chunks as usize
    }

    /// Percent of chunks received, rounded down.
    pub fn received_percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        let pct = self.uploaded_chunks.len() as u64 * 100 / self.total_chunks as u64;
        pct.min(100) as u8
    }

    /// Records a received chunk. Returns `false` when the index was already present.
    pub fn record_chunk(&mut self, index: u32) -> UploadResult<bool> {
        if index >= self.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index,
                total: self.total_chunks,
            });
        }
        if self.has_chunk(index) {
            return Ok(false);
        }
        self.transition(TaskStatus::Uploading)?;
        self.uploaded_chunks.insert(index);
        self.progress = self.received_percent();
        Ok(true)
    }

    /// `uploading → merging`, guarded by every chunk being present.
    pub fn begin_merge(&mut self) -> UploadResult<()> {
        if !self.is_fully_received() {
            return Err(UploadError::ChunksIncomplete {
                received: self.uploaded_chunks.len(),
                total: self.total_chunks,
            });
        }
        self.transition(TaskStatus::Merging)
    }

    /// `merging → processing` once the merged file is at `file_path`.
    pub fn finish_merge(&mut self, file_path: impl Into<String>) -> UploadResult<()> {
        self.transition(TaskStatus::Processing)?;
        self.file_path = Some(file_path.into());
        self.progress = MERGED_PROGRESS;
        Ok(())
    }

    /// Records the category and marks the resource insert as attempted.
    pub fn begin_finalize(&mut self, category: impl Into<String>) -> UploadResult<()> {
        self.expect_status(TaskStatus::Processing)?;
        self.category = Some(category.into());
        self.progress = FINALIZING_PROGRESS;
        self.finalize_attempted = true;
        self.updated_at = now();
        Ok(())
    }

    /// `processing → completed` with the produced resource id.
    pub fn complete(&mut self, resource_id: i64) -> UploadResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.resource_id = Some(resource_id);
        self.error = None;
        self.progress = 100;
        Ok(())
    }

    /// Any non-terminal status `→ failed`.
    pub fn fail(&mut self, message: impl Into<String>) -> UploadResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(message.into());
        self.resource_id = None;
        Ok(())
    }

    pub fn expect_status(&self, expected: TaskStatus) -> UploadResult<()> {
        if self.status != expected {
            return Err(UploadError::UnexpectedStatus {
                expected,
                actual: self.status,
            });
        }
        Ok(())
    }

    /// Checks the record-level invariants between status, chunks, error and resource id.
    pub fn is_consistent(&self) -> bool {
        let resource_ok = self.resource_id.is_some() == (self.status == TaskStatus::Completed);
        let error_ok = self.error.is_some() == (self.status == TaskStatus::Failed);
        let chunks_ok = match self.status {
            TaskStatus::Merging | TaskStatus::Processing | TaskStatus::Completed => {
                self.is_fully_received()
            }
            TaskStatus::Pending => self.uploaded_chunks.is_empty(),
            TaskStatus::Uploading | TaskStatus::Failed => true,
        };
        resource_ok && error_ok && chunks_ok && self.progress <= 100
    }

    /// Whether this record survives a recovery scan that keeps terminal
    /// tasks updated at or after `terminal_cutoff`.
    pub fn is_recoverable(&self, terminal_cutoff: DateTime<Utc>) -> bool {
        !self.status.is_terminal() || self.updated_at >= terminal_cutoff
    }
}

/// A row handed to the [`ResourceStore`](crate::store::ResourceStore) when an
/// upload is promoted to a permanent resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResource {
    /// Stored file name on disk.
    pub name: String,
    /// Name the uploader declared.
    pub original_name: String,
    /// True byte size of the stored file.
    pub size: u64,
    pub category: String,
    pub description: String,
    pub file_path: String,
    pub file_type: String,
    pub owner_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> UploadTask {
        UploadTask::new(7, "a.png", 1000, None, 0).unwrap()
    }

    #[test]
    fn new_task_is_single_chunk_pending() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.total_chunks, 1);
        assert_eq!(t.chunk_size, 1000);
        assert_eq!(t.progress, 0);
        assert!(t.is_consistent());
    }

    #[test]
    fn plan_chunks_splits_when_limited() {
        assert_eq!(plan_chunks(1000, 0).unwrap(), (1000, 1));
        assert_eq!(plan_chunks(1000, 4096).unwrap(), (1000, 1));
        assert_eq!(plan_chunks(1000, 300).unwrap(), (300, 4));
        assert!(plan_chunks(0, 0).is_err());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(
            UploadTask::new(1, "  ", 10, None, 0),
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Merging));
        assert!(Merging.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        for s in [Pending, Uploading, Merging, Processing] {
            assert!(s.can_transition_to(Failed), "{} -> failed", s);
        }
        assert!(!Pending.can_transition_to(Merging));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Uploading));
        assert!(!Processing.can_transition_to(Merging));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in TaskStatus::ALL {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert!("cancelled".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn record_chunk_is_idempotent() {
        let mut t = task();
        assert!(t.record_chunk(0).unwrap());
        assert_eq!(t.status, TaskStatus::Uploading);
        assert_eq!(t.progress, 100);
        let snapshot = t.clone();
        assert!(!t.record_chunk(0).unwrap());
        assert_eq!(t, snapshot);
    }

    #[test]
    fn record_chunk_rejects_out_of_range() {
        let mut t = task();
        assert!(matches!(
            t.record_chunk(1),
            Err(UploadError::InvalidChunkIndex { index: 1, total: 1 })
        ));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn multi_chunk_progress() {
        let mut t = UploadTask::new(1, "big.zip", 1000, None, 300).unwrap();
        t.record_chunk(2).unwrap();
        assert_eq!(t.progress, 25);
        t.record_chunk(0).unwrap();
        assert_eq!(t.progress, 50);
        assert!(matches!(
            t.begin_merge(),
            Err(UploadError::ChunksIncomplete {
                received: 2,
                total: 4
            })
        ));
    }

    #[test]
    fn begin_merge_requires_all_chunks() {
        let mut t = task();
        assert!(matches!(
            t.begin_merge(),
            Err(UploadError::ChunksIncomplete { received: 0, .. })
        ));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn success_path_keeps_invariants() {
        let mut t = task();
        t.record_chunk(0).unwrap();
        assert!(t.is_consistent());
        t.begin_merge().unwrap();
        assert!(t.is_consistent());
        t.finish_merge("/uploads/x.png").unwrap();
        assert_eq!(t.progress, MERGED_PROGRESS);
        assert!(t.is_consistent());
        t.begin_finalize("图片").unwrap();
        assert!(t.finalize_attempted);
        assert_eq!(t.progress, FINALIZING_PROGRESS);
        t.complete(42).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.resource_id, Some(42));
        assert_eq!(t.progress, 100);
        assert!(t.is_consistent());
    }

    #[test]
    fn fail_sets_error_and_is_terminal() {
        let mut t = task();
        t.record_chunk(0).unwrap();
        t.begin_merge().unwrap();
        t.fail("merge failed: missing chunk").unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.error.is_some());
        assert!(t.resource_id.is_none());
        assert!(t.is_consistent());
        assert!(t.fail("again").is_err());
        assert!(t.complete(1).is_err());
    }

    #[test]
    fn begin_finalize_requires_processing() {
        let mut t = task();
        assert!(matches!(
            t.begin_finalize("其他"),
            Err(UploadError::UnexpectedStatus {
                expected: TaskStatus::Processing,
                actual: TaskStatus::Pending
            })
        ));
    }

    #[test]
    fn recoverable_window() {
        let mut t = task();
        let cutoff = t.updated_at + chrono::Duration::hours(1);
        assert!(t.is_recoverable(cutoff), "non-terminal tasks always recover");
        t.record_chunk(0).unwrap();
        t.fail("boom").unwrap();
        assert!(!t.is_recoverable(t.updated_at + chrono::Duration::seconds(1)));
        assert!(t.is_recoverable(t.updated_at));
    }

    #[test]
    fn serializes_status_lowercase() {
        let t = task();
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["uploaded_chunks"], serde_json::json!([]));
    }
}
