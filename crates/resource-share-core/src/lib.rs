//! # Resource Share Core
//!
//! Runtime-agnostic logic for the Resource Share upload engine: the upload
//! task model and its state machine, the file-type classifier, error types,
//! and the storage traits the engine persists through.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The server crate
//! supplies SQLite-backed store implementations; the in-memory stores in
//! [`store::memory`] back the tests.

pub mod classify;
pub mod error;
pub mod models;
pub mod store;

pub use error::{UploadError, UploadResult};
pub use models::{NewResource, TaskStatus, UploadTask};
