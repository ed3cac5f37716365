//! Byte-level progress for the simple (single request) upload path.
//!
//! [`ProgressReader`] wraps the request body and reports the cumulative
//! byte count after every read. The handler feeds those counts into a
//! shared [`ProgressTracker`], which `GET /api/upload/progress/{id}` reads
//! concurrently. Entries expire a fixed time after the upload finishes.

use std::collections::HashMap;
use std::io::{self, Read};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use serde::Serialize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;

pin_project! {
    /// Forwards every byte of `inner` unchanged and calls `on_progress` with
    /// the running total once per completed read, zero-byte reads included.
    pub struct ProgressReader<R, F> {
        #[pin]
        inner: R,
        on_progress: F,
        total: u64,
    }
}

impl<R, F> ProgressReader<R, F>
where
    F: FnMut(u64),
{
    pub fn new(inner: R, on_progress: F) -> Self {
        Self {
            inner,
            on_progress,
            total: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.total
    }
}

impl<R, F> AsyncRead for ProgressReader<R, F>
where
    R: AsyncRead,
    F: FnMut(u64),
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                *this.total += (buf.filled().len() - before) as u64;
                (this.on_progress)(*this.total);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<R, F> Read for ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.total += n as u64;
        (self.on_progress)(self.total);
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Uploading,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct ProgressEntry {
    /// User that started the upload; only they (or an admin) may read it.
    pub owner_id: i64,
    /// Declared size; `0` when the client did not send one.
    pub total_size: u64,
    pub uploaded: u64,
    pub started_at: Instant,
    pub file_name: String,
    pub status: TransferStatus,
    pub error_message: Option<String>,
}

impl ProgressEntry {
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded as f64 / self.total_size as f64 * 100.0).min(100.0)
    }

    /// Bytes per second since the entry was created.
    pub fn speed(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.uploaded as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn report(&self, upload_id: &str) -> ProgressReport {
        ProgressReport {
            upload_id: upload_id.to_string(),
            total_size: self.total_size,
            uploaded: self.uploaded,
            progress: self.percent(),
            speed: self.speed(),
            status: self.status,
            file_name: self.file_name.clone(),
            error_message: self.error_message.clone().unwrap_or_default(),
            elapsed_time: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

/// JSON body of `GET /api/upload/progress/{upload_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub upload_id: String,
    pub total_size: u64,
    pub uploaded: u64,
    pub progress: f64,
    pub speed: f64,
    pub status: TransferStatus,
    pub file_name: String,
    pub error_message: String,
    pub elapsed_time: f64,
}

/// Concurrently readable map of in-flight simple uploads.
///
/// Uses a blocking lock because updates come from the synchronous
/// [`ProgressReader`] callback; no lock is held across an await.
#[derive(Default)]
pub struct ProgressTracker {
    entries: RwLock<HashMap<String, ProgressEntry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) tracking `upload_id` for `owner_id`.
    pub fn start(&self, upload_id: &str, owner_id: i64, file_name: &str, total_size: u64) {
        let entry = ProgressEntry {
            owner_id,
            total_size,
            uploaded: 0,
            started_at: Instant::now(),
            file_name: file_name.to_string(),
            status: TransferStatus::Uploading,
            error_message: None,
        };
        self.write().insert(upload_id.to_string(), entry);
    }

    /// Raises the byte count; a smaller value than already recorded is ignored.
    pub fn update(&self, upload_id: &str, uploaded: u64) {
        if let Some(entry) = self.write().get_mut(upload_id) {
            entry.uploaded = entry.uploaded.max(uploaded);
        }
    }

    /// Marks the upload done. `size` is the true stored size and replaces
    /// the declared total, which may include request framing.
    pub fn complete(&self, upload_id: &str, size: u64) {
        if let Some(entry) = self.write().get_mut(upload_id) {
            entry.uploaded = entry.uploaded.max(size);
            entry.total_size = size;
            entry.status = TransferStatus::Completed;
        }
    }

    pub fn fail(&self, upload_id: &str, message: impl Into<String>) {
        if let Some(entry) = self.write().get_mut(upload_id) {
            entry.status = TransferStatus::Error;
            entry.error_message = Some(message.into());
        }
    }

    /// Fails the upload only if it is still in flight; a recorded outcome wins.
    pub fn abandon(&self, upload_id: &str, message: impl Into<String>) {
        if let Some(entry) = self.write().get_mut(upload_id) {
            if entry.status == TransferStatus::Uploading {
                entry.status = TransferStatus::Error;
                entry.error_message = Some(message.into());
            }
        }
    }

    pub fn get(&self, upload_id: &str) -> Option<ProgressEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(upload_id)
            .cloned()
    }

    pub fn remove(&self, upload_id: &str) -> Option<ProgressEntry> {
        self.write().remove(upload_id)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the entry after `ttl`. A newer upload that reused the same id
    /// in the meantime is left alone.
    pub fn schedule_expiry(self: &Arc<Self>, upload_id: String, ttl: Duration) -> JoinHandle<()> {
        let started = self.get(&upload_id).map(|e| e.started_at);
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut entries = tracker.write();
            let same_upload = entries
                .get(&upload_id)
                .is_some_and(|e| Some(e.started_at) == started);
            if same_upload {
                entries.remove(&upload_id);
                tracing::debug!(upload_id = %upload_id, "Progress entry expired");
            }
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ProgressEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
