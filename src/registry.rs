//! In-memory task registry with durable write-through.
//!
//! The [`TaskRegistry`] owns the authoritative map of upload tasks for this
//! process. Every mutation is mirrored to the injected [`TaskStore`] while
//! the write lock is still held, so no reader observes an in-memory record
//! that the store has not been asked to persist.
//!
//! # Locking
//!
//! ```text
//!   get / list_by_owner ──▶ read lock  (parallel)
//!   set / update / delete ─▶ write lock ─▶ store write ─▶ unlock
//! ```
//!
//! A failed store write is logged and does not roll back the in-memory
//! change; the next successful write of the same task reconciles the row.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;

use resource_share_core::models::UploadTask;
use resource_share_core::store::TaskStore;
use resource_share_core::{UploadError, UploadResult};

/// Process-wide registry of upload tasks.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, UploadTask>>,
    store: Arc<dyn TaskStore>,
    retention: chrono::Duration,
}

impl TaskRegistry {
    /// Creates an empty registry persisting through `store`. Terminal tasks
    /// older than `retention` are skipped by [`recover`](Self::recover).
    pub fn new(store: Arc<dyn TaskStore>, retention: chrono::Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            store,
            retention,
        }
    }

    pub async fn get(&self, id: &str) -> Option<UploadTask> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Inserts or replaces `task` and persists it.
    pub async fn set(&self, task: UploadTask) {
        let mut tasks = self.tasks.write().await;
        self.persist(&task).await;
        tasks.insert(task.id.clone(), task);
    }

    /// Applies `mutate` to the task with `id` and persists the result.
    ///
    /// The mutation runs on a copy: if it returns an error the stored record
    /// is left exactly as it was. Returns [`UploadError::NotFound`] when the
    /// task is absent, which is how pipeline stages learn that a task was
    /// cancelled underneath them.
    pub async fn update<F>(&self, id: &str, mutate: F) -> UploadResult<UploadTask>
    where
        F: FnOnce(&mut UploadTask) -> UploadResult<()>,
    {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

        let mut next = current.clone();
        mutate(&mut next)?;

        if next != *current {
            self.persist(&next).await;
            tasks.insert(next.id.clone(), next.clone());
        }
        Ok(next)
    }

    /// Removes the task from memory and from the durable store.
    /// Returns the removed record, if there was one.
    pub async fn delete(&self, id: &str) -> Option<UploadTask> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.remove(id);
        if let Err(e) = self.store.delete(id).await {
            tracing::warn!(task_id = %id, error = %e, "Failed to delete persisted task");
        }
        removed
    }

    /// Snapshot of every task owned by `owner_id`, ordered by task id.
    pub async fn list_by_owner(&self, owner_id: i64) -> Vec<UploadTask> {
        let tasks = self.tasks.read().await;
        let mut owned: Vec<UploadTask> = tasks
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        owned
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Loads recoverable tasks from the store into memory.
    ///
    /// Returns the ids of tasks left in `merging` or `processing`; the caller
    /// re-dispatches the pipeline for each of them.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - self.retention;
        let loaded = self.store.load_recoverable(cutoff).await?;

        let mut tasks = self.tasks.write().await;
        let mut resumable = Vec::new();
        for task in loaded {
            if task.status.is_resumable() {
                resumable.push(task.id.clone());
            }
            tasks.insert(task.id.clone(), task);
        }

        tracing::info!(
            loaded = tasks.len(),
            resumable = resumable.len(),
            "Recovered upload tasks"
        );
        Ok(resumable)
    }

    async fn persist(&self, task: &UploadTask) {
        if let Err(e) = self.store.upsert(task).await {
            tracing::warn!(
                task_id = %task.id,
                status = %task.status,
                error = %e,
                "Failed to persist task; in-memory state kept"
            );
        }
    }
}
