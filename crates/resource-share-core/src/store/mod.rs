//! Storage abstractions for the upload engine.
//!
//! [`TaskStore`] is the durable mirror of the task registry: it is written on
//! every registry mutation and read only during startup recovery.
//! [`ResourceStore`] is the boundary to the resource catalogue that a
//! finished upload is promoted into.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{NewResource, UploadTask};

/// Durable storage for [`UploadTask`] records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](TaskStore::upsert) | Write the full record, keyed by id |
/// | [`load_recoverable`](TaskStore::load_recoverable) | Startup recovery scan |
/// | [`delete`](TaskStore::delete) | Remove a cancelled task |
/// | [`purge_stale`](TaskStore::purge_stale) | Drop terminal rows past retention |
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite the task row. Safe to repeat with the same id.
    async fn upsert(&self, task: &UploadTask) -> Result<()>;

    /// Every non-terminal task, plus terminal tasks updated at or after
    /// `terminal_cutoff`.
    async fn load_recoverable(&self, terminal_cutoff: DateTime<Utc>) -> Result<Vec<UploadTask>>;

    /// Remove the task row. Deleting an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Delete terminal tasks last updated before `terminal_cutoff`.
    /// Returns the number of rows removed.
    async fn purge_stale(&self, terminal_cutoff: DateTime<Utc>) -> Result<u64>;
}

/// The resource catalogue a completed upload is registered in.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Insert one resource row and return its identifier.
    async fn insert(&self, resource: &NewResource) -> Result<i64>;

    /// Look up a resource previously registered for `file_path`.
    async fn find_by_path(&self, file_path: &str) -> Result<Option<i64>>;

    /// Remove a resource row. Used to roll back a registration whose task
    /// was cancelled while it was being finalized.
    async fn remove(&self, resource_id: i64) -> Result<()>;
}
