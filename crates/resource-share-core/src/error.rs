//! Upload engine error types.

use thiserror::Error;

use crate::models::TaskStatus;

/// Errors raised by upload task operations.
///
/// Ownership, not-found, and precondition errors leave the task untouched.
/// I/O and resource-store errors raised inside the pipeline are recorded on
/// the task and drive it to [`TaskStatus::Failed`].
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("forbidden: task {0} belongs to another user")]
    Forbidden(String),

    #[error("chunks incomplete: received {received} of {total}")]
    ChunksIncomplete { received: usize, total: u32 },

    #[error("invalid chunk index {index}: task has {total} chunks")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("chunk too large: exceeds chunk size of {limit} bytes")]
    ChunkTooLarge { limit: u64 },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task is {actual}, expected {expected}")]
    UnexpectedStatus {
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource store error: {0}")]
    Resource(String),
}

/// Result type for upload task operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;
