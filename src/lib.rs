//! # Resource Share
//!
//! Upload subsystem of a file-sharing service: resumable chunked uploads
//! that survive restarts, a single-request upload path with live byte
//! progress, and promotion of finished uploads into the resource catalogue.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum) ──▶ UploadEngine ──▶ TaskRegistry ──▶ SQLite upload_tasks
//!                        │                ▲
//!                        ▼                │ checkpoints
//!                   ChunkStorage ◀── pipeline (merge → finalize) ──▶ resources
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rshare init                       # create database
//! rshare token --user 1             # mint a bearer token
//! rshare serve                      # start HTTP server
//! rshare tasks                      # inspect persisted tasks
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`auth`] | Bearer tokens and caller identity |
//! | [`registry`] | In-memory task map with durable write-through |
//! | [`chunks`] | On-disk chunk and merged-file layout |
//! | [`engine`] | Task operations (init, chunk, complete, status, cancel) |
//! | [`pipeline`] | Background merge and finalize stages |
//! | [`progress`] | Byte progress for single-request uploads |
//! | [`server`] | HTTP API |
//! | [`sqlite_store`] | SQLite task and resource stores |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`tasks`] | `rshare tasks` and `rshare purge` reports |

pub mod auth;
pub mod chunks;
pub mod config;
pub mod db;
pub mod engine;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod server;
pub mod sqlite_store;
pub mod tasks;
