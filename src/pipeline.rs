//! Background processing of completed uploads.
//!
//! A task handed to [`UploadEngine::dispatch`] walks two stages, each
//! checkpointed through the registry before the next begins:
//!
//! ```text
//!   merging ──merge_stage──▶ processing ──finalize_stage──▶ completed
//!      │                          │
//!      └──────────▶ failed ◀──────┘
//! ```
//!
//! Because every checkpoint is persisted, a process restart resumes from
//! the last recorded stage. Each stage is safe to run again: the merge
//! rewrites a deterministic path and the finalize stage looks up the
//! resource it may already have inserted.
//!
//! A stage whose checkpoint write reports the task as missing treats it as
//! cancelled and removes whatever it produced.
//!
//! At most one run per task is active in the process; a second dispatch
//! of a task that is already running returns immediately.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use resource_share_core::classify::file_type_for;
use resource_share_core::models::{NewResource, TaskStatus, UploadTask};
use resource_share_core::UploadError;

use crate::chunks::remove_file_if_exists;
use crate::engine::UploadEngine;

enum Stage {
    Continue,
    Done,
}

/// Marks a task as owned by one pipeline run until dropped.
struct RunClaim<'a> {
    running: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl<'a> RunClaim<'a> {
    fn acquire(running: &'a Mutex<HashSet<String>>, task_id: &str) -> Option<Self> {
        let mut set = running.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(task_id.to_string()) {
            return None;
        }
        Some(Self {
            running,
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

impl UploadEngine {
    /// Runs the pipeline for `task_id` on a background task.
    pub fn dispatch(self: &Arc<Self>, task_id: String) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.process_task(&task_id).await;
        })
    }

    /// Drives `task_id` from its current status until it is terminal,
    /// cancelled, or in a status the pipeline does not own.
    pub async fn process_task(&self, task_id: &str) {
        let Some(_claim) = RunClaim::acquire(&self.running, task_id) else {
            tracing::debug!(task_id, "Pipeline already running; dispatch ignored");
            return;
        };
        loop {
            let Some(task) = self.registry.get(task_id).await else {
                tracing::debug!(task_id, "Task gone; pipeline stopped");
                return;
            };
            let stage = match task.status {
                TaskStatus::Merging => self.merge_stage(task).await,
                TaskStatus::Processing => self.finalize_stage(task).await,
                _ => return,
            };
            if let Stage::Done = stage {
                return;
            }
        }
    }

    async fn merge_stage(&self, task: UploadTask) -> Stage {
        let dest = self.storage.merged_path(&task);

        match self
            .storage
            .merge_chunks(&task.id, task.total_chunks, &dest)
            .await
        {
            Ok(bytes) => {
                tracing::info!(task_id = %task.id, bytes, path = %dest.display(), "Chunks merged");
            }
            Err(e) => {
                if self
                    .fail_task(&task.id, TaskStatus::Merging, format!("merge failed: {}", e))
                    .await
                {
                    self.discard(&task.id, &dest).await;
                }
                return Stage::Done;
            }
        }

        let file_path = dest.to_string_lossy().into_owned();
        match self
            .registry
            .update(&task.id, |t| t.finish_merge(file_path))
            .await
        {
            Ok(_) => {}
            Err(UploadError::NotFound(_)) => {
                tracing::info!(task_id = %task.id, "Task cancelled during merge");
                self.discard(&task.id, &dest).await;
                return Stage::Done;
            }
            Err(e) => {
                tracing::debug!(task_id = %task.id, error = %e, "Merge checkpoint skipped");
                return Stage::Done;
            }
        }

        if let Err(e) = self.storage.remove_task_dir(&task.id).await {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to remove chunk directory");
        }
        Stage::Continue
    }

    async fn finalize_stage(&self, task: UploadTask) -> Stage {
        let Some(file_path) = task.file_path.clone() else {
            self.fail_task(&task.id, TaskStatus::Processing, "merged file path missing")
                .await;
            return Stage::Done;
        };
        let path = PathBuf::from(&file_path);

        // Left behind when the process stopped between the merge checkpoint
        // and the chunk cleanup.
        if let Err(e) = self.storage.remove_task_dir(&task.id).await {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to remove chunk directory");
        }

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.fail_and_discard(&task.id, format!("cannot read merged file: {}", e), &path)
                    .await;
                return Stage::Done;
            }
        };

        let file_type = file_type_for(&task.file_name);
        let category = file_type.category();

        // Read from the record under the registry lock, not the snapshot.
        let mut replay = false;
        match self
            .registry
            .update(&task.id, |t| {
                replay = t.finalize_attempted;
                t.begin_finalize(category)
            })
            .await
        {
            Ok(_) => {}
            Err(UploadError::NotFound(_)) => {
                self.discard(&task.id, &path).await;
                return Stage::Done;
            }
            Err(e) => {
                tracing::debug!(task_id = %task.id, error = %e, "Finalize checkpoint skipped");
                return Stage::Done;
            }
        }

        let existing = if replay {
            match self.resources.find_by_path(&file_path).await {
                Ok(found) => found,
                Err(e) => {
                    // The resource may exist; keep the file it would point at.
                    self.fail_task(
                        &task.id,
                        TaskStatus::Processing,
                        format!("resource lookup failed: {}", e),
                    )
                    .await;
                    return Stage::Done;
                }
            }
        } else {
            None
        };

        let resource_id = match existing {
            Some(id) => {
                tracing::info!(task_id = %task.id, resource_id = id, "Resource already registered");
                id
            }
            None => {
                let record = NewResource {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| task.id.clone()),
                    original_name: task.file_name.clone(),
                    size,
                    category: category.to_string(),
                    description: task.description.clone().unwrap_or_default(),
                    file_path: file_path.clone(),
                    file_type: file_type.as_str().to_string(),
                    owner_id: task.owner_id,
                };
                match self.resources.insert(&record).await {
                    Ok(id) => id,
                    Err(e) => {
                        self.fail_and_discard(
                            &task.id,
                            format!("resource registration failed: {}", e),
                            &path,
                        )
                        .await;
                        return Stage::Done;
                    }
                }
            }
        };

        match self
            .registry
            .update(&task.id, |t| t.complete(resource_id))
            .await
        {
            Ok(done) => {
                tracing::info!(
                    task_id = %done.id,
                    resource_id,
                    size,
                    category,
                    "Upload completed"
                );
            }
            Err(UploadError::NotFound(_)) => {
                tracing::info!(task_id = %task.id, resource_id, "Task cancelled during finalize; rolling back");
                if let Err(e) = self.resources.remove(resource_id).await {
                    tracing::warn!(resource_id, error = %e, "Failed to roll back resource");
                }
                self.discard(&task.id, &path).await;
            }
            Err(e) => {
                tracing::debug!(task_id = %task.id, error = %e, "Completion checkpoint skipped");
            }
        }
        Stage::Done
    }

    /// Records a failure if the task is still in `expected`. Returns whether
    /// files the stage produced may be removed: true when the failure was
    /// recorded or the task no longer exists, false when another run has
    /// moved the task on.
    async fn fail_task(&self, task_id: &str, expected: TaskStatus, message: impl Into<String>) -> bool {
        let message = message.into();
        let recorded = message.clone();
        match self
            .registry
            .update(task_id, |t| {
                t.expect_status(expected)?;
                t.fail(recorded)
            })
            .await
        {
            Ok(_) => {
                tracing::warn!(task_id, error = %message, "Upload failed");
                true
            }
            Err(UploadError::NotFound(_)) => true,
            Err(e) => {
                tracing::debug!(task_id, error = %e, "Failure not recorded; task moved on");
                false
            }
        }
    }

    async fn fail_and_discard(&self, task_id: &str, message: String, path: &Path) {
        if self.fail_task(task_id, TaskStatus::Processing, message).await {
            self.discard(task_id, path).await;
        }
    }

    async fn discard(&self, task_id: &str, path: &Path) {
        if let Err(e) = remove_file_if_exists(path).await {
            tracing::warn!(task_id, path = %path.display(), error = %e, "Failed to remove merged file");
        }
    }
}
