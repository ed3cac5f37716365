//! In-memory [`TaskStore`] and [`ResourceStore`] implementations for testing.
//!
//! Both use `HashMap` behind `std::sync::RwLock` for thread safety.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{NewResource, UploadTask};

use super::{ResourceStore, TaskStore};

/// In-memory task store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, UploadTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the persisted copy of a task, if any.
    pub fn get(&self, id: &str) -> Option<UploadTask> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn upsert(&self, task: &UploadTask) -> Result<()> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_recoverable(&self, terminal_cutoff: DateTime<Utc>) -> Result<Vec<UploadTask>> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<UploadTask> = tasks
            .values()
            .filter(|t| t.is_recoverable(terminal_cutoff))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    async fn purge_stale(&self, terminal_cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        tasks.retain(|_, t| t.is_recoverable(terminal_cutoff));
        Ok((before - tasks.len()) as u64)
    }
}

/// A resource row held by [`InMemoryResourceStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResource {
    pub id: i64,
    pub resource: NewResource,
}

/// In-memory resource catalogue with sequential ids starting at 1.
#[derive(Default)]
pub struct InMemoryResourceStore {
    rows: RwLock<Vec<StoredResource>>,
    next_id: RwLock<i64>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored resource in insertion order.
    pub fn all(&self) -> Vec<StoredResource> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, id: i64) -> Option<StoredResource> {
        self.all().into_iter().find(|r| r.id == id)
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn insert(&self, resource: &NewResource) -> Result<i64> {
        let mut next = self.next_id.write().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        let id = *next;
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredResource {
                id,
                resource: resource.clone(),
            });
        Ok(id)
    }

    async fn find_by_path(&self, file_path: &str) -> Result<Option<i64>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.resource.file_path == file_path)
            .map(|r| r.id))
    }

    async fn remove(&self, resource_id: i64) -> Result<()> {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.id != resource_id);
        Ok(())
    }
}
