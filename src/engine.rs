//! Chunked upload engine.
//!
//! [`UploadEngine`] is the entry point for every task operation the API
//! exposes: create a task, receive chunks, request completion, read status,
//! list, and cancel. Completion hands the task to the background pipeline
//! (see [`crate::pipeline`]), which merges the chunks and registers the
//! resulting resource.
//!
//! # Ownership
//!
//! Chunk uploads and completion are restricted to the task's owner. Status
//! and cancel additionally allow callers with the admin role.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use resource_share_core::models::{TaskStatus, UploadTask};
use resource_share_core::store::ResourceStore;
use resource_share_core::{UploadError, UploadResult};

use crate::auth::Caller;
use crate::chunks::{remove_file_if_exists, ChunkStorage, ChunkWrite};
use crate::config::UploadConfig;
use crate::registry::TaskRegistry;

/// Limits applied when creating tasks.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Largest chunk a task is split into; `0` means a single chunk.
    pub chunk_size: u64,
    pub max_upload_size: u64,
}

impl From<&UploadConfig> for EngineSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_upload_size: config.max_upload_size,
        }
    }
}

/// Request body for creating a task.
#[derive(Debug, Clone, Deserialize)]
pub struct InitUpload {
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub description: Option<String>,
}

/// What the caller learns after sending one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkReceipt {
    pub task_id: String,
    pub chunk_index: u32,
    pub uploaded_chunks: usize,
    pub total_chunks: u32,
    pub progress: u8,
    /// The chunk had already been received; nothing was written.
    pub duplicate: bool,
}

impl ChunkReceipt {
    fn new(task: &UploadTask, chunk_index: u32, duplicate: bool) -> Self {
        Self {
            task_id: task.id.clone(),
            chunk_index,
            uploaded_chunks: task.uploaded_chunks.len(),
            total_chunks: task.total_chunks,
            progress: task.progress,
            duplicate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// No task with that id exists; treated as success.
    AlreadyGone,
}

pub struct UploadEngine {
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) storage: ChunkStorage,
    pub(crate) resources: Arc<dyn ResourceStore>,
    /// Task ids with a pipeline run in progress.
    pub(crate) running: Mutex<HashSet<String>>,
    settings: EngineSettings,
}

impl UploadEngine {
    pub fn new(
        registry: Arc<TaskRegistry>,
        storage: ChunkStorage,
        resources: Arc<dyn ResourceStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            storage,
            resources,
            running: Mutex::new(HashSet::new()),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &ChunkStorage {
        &self.storage
    }

    pub fn resources(&self) -> &Arc<dyn ResourceStore> {
        &self.resources
    }

    /// Creates a `pending` task owned by `caller`.
    pub async fn init_upload(&self, caller: &Caller, request: InitUpload) -> UploadResult<UploadTask> {
        if request.file_size > self.settings.max_upload_size {
            return Err(UploadError::InvalidRequest(format!(
                "file_size {} exceeds the upload limit of {} bytes",
                request.file_size, self.settings.max_upload_size
            )));
        }

        let description = request.description.filter(|d| !d.trim().is_empty());
        let task = UploadTask::new(
            caller.user_id,
            request.file_name,
            request.file_size,
            description,
            self.settings.chunk_size,
        )?;
        self.registry.set(task.clone()).await;

        tracing::info!(
            task_id = %task.id,
            owner_id = task.owner_id,
            file_size = task.file_size,
            total_chunks = task.total_chunks,
            "Upload task created"
        );
        Ok(task)
    }

    /// Streams one chunk from `body` into transient storage and records it.
    ///
    /// A chunk that was already received is acknowledged without rewriting
    /// it. A failed disk write leaves the task unchanged so the client can
    /// retry the same index.
    pub async fn receive_chunk<R>(
        &self,
        task_id: &str,
        chunk_index: u32,
        caller: &Caller,
        body: R,
    ) -> UploadResult<ChunkReceipt>
    where
        R: AsyncRead + Unpin,
    {
        let task = self.lookup(task_id).await?;
        ensure_owner(&task, caller)?;

        if chunk_index >= task.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index: chunk_index,
                total: task.total_chunks,
            });
        }
        if task.has_chunk(chunk_index) {
            tracing::debug!(task_id, chunk_index, "Duplicate chunk ignored");
            return Ok(ChunkReceipt::new(&task, chunk_index, true));
        }
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Uploading) {
            return Err(UploadError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Uploading,
            });
        }

        let written = match self
            .storage
            .write_chunk(&task.id, chunk_index, body, task.chunk_size)
            .await
        {
            Ok(ChunkWrite::Written(bytes)) => bytes,
            Ok(ChunkWrite::TooLarge) => {
                return Err(UploadError::ChunkTooLarge {
                    limit: task.chunk_size,
                })
            }
            Err(e) => {
                tracing::warn!(task_id, chunk_index, error = %e, "Chunk write failed");
                return Err(e.into());
            }
        };

        let updated = match self
            .registry
            .update(&task.id, |t| t.record_chunk(chunk_index).map(|_| ()))
            .await
        {
            Ok(updated) => updated,
            Err(UploadError::NotFound(id)) => {
                // Cancelled while the chunk was streaming.
                let _ = self.storage.remove_task_dir(&id).await;
                return Err(UploadError::NotFound(id));
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            task_id,
            chunk_index,
            bytes = written,
            received = updated.uploaded_chunks.len(),
            total = updated.total_chunks,
            "Chunk stored"
        );
        Ok(ChunkReceipt::new(&updated, chunk_index, false))
    }

    /// Moves a fully received task to `merging` and starts the pipeline.
    ///
    /// Returns as soon as the task is queued; poll [`status`](Self::status)
    /// for the outcome.
    pub async fn complete_upload(
        self: &Arc<Self>,
        task_id: &str,
        caller: &Caller,
    ) -> UploadResult<UploadTask> {
        let task = self.lookup(task_id).await?;
        ensure_owner(&task, caller)?;

        let task = self.registry.update(task_id, |t| t.begin_merge()).await?;
        tracing::info!(task_id, "Upload complete; merge queued");
        self.dispatch(task.id.clone());
        Ok(task)
    }

    pub async fn status(&self, task_id: &str, caller: &Caller) -> UploadResult<UploadTask> {
        let task = self.lookup(task_id).await?;
        ensure_visible(&task, caller)?;
        Ok(task)
    }

    /// The caller's own tasks. Never fails.
    pub async fn list_tasks(&self, caller: &Caller) -> Vec<UploadTask> {
        self.registry.list_by_owner(caller.user_id).await
    }

    /// Deletes the task and everything it left on disk.
    ///
    /// The merged file of a completed task belongs to its resource and is
    /// kept. A pipeline stage still running for the task notices the
    /// deletion at its next checkpoint and cleans up what it produced.
    pub async fn cancel(&self, task_id: &str, caller: &Caller) -> UploadResult<CancelOutcome> {
        let Some(task) = self.registry.get(task_id).await else {
            return Ok(CancelOutcome::AlreadyGone);
        };
        ensure_visible(&task, caller)?;

        let Some(task) = self.registry.delete(task_id).await else {
            return Ok(CancelOutcome::AlreadyGone);
        };

        if let Err(e) = self.storage.remove_task_dir(&task.id).await {
            tracing::warn!(task_id, error = %e, "Failed to remove chunk directory");
        }
        if task.status != TaskStatus::Completed {
            let merged = self.storage.merged_path(&task);
            if let Err(e) = remove_file_if_exists(&merged).await {
                tracing::warn!(task_id, error = %e, "Failed to remove merged file");
            }
        }

        tracing::info!(task_id, status = %task.status, "Upload task cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Reloads persisted tasks and restarts the pipeline for every task
    /// that stopped in `merging` or `processing`. Returns how many were
    /// re-dispatched.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<usize> {
        let resumable = self.registry.recover().await?;
        for task_id in &resumable {
            tracing::info!(task_id = %task_id, "Resuming interrupted upload");
            self.dispatch(task_id.clone());
        }
        Ok(resumable.len())
    }

    async fn lookup(&self, task_id: &str) -> UploadResult<UploadTask> {
        self.registry
            .get(task_id)
            .await
            .ok_or_else(|| UploadError::NotFound(task_id.to_string()))
    }
}

fn ensure_owner(task: &UploadTask, caller: &Caller) -> UploadResult<()> {
    if task.owner_id != caller.user_id {
        return Err(UploadError::Forbidden(task.id.clone()));
    }
    Ok(())
}

fn ensure_visible(task: &UploadTask, caller: &Caller) -> UploadResult<()> {
    if caller.is_admin() {
        return Ok(());
    }
    ensure_owner(task, caller)
}
