//! HTTP API for uploads.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/upload/init` | Create a chunked upload task |
//! | `POST` | `/api/upload/chunk` | Send one chunk (multipart `task_id`, `chunk_index`, `chunk`) |
//! | `POST` | `/api/upload/complete` | Queue a fully received task for merging |
//! | `GET`  | `/api/upload/status/{task_id}` | Full task record |
//! | `GET`  | `/api/upload/tasks` | The caller's tasks |
//! | `DELETE` | `/api/upload/cancel/{task_id}` | Cancel and clean up a task |
//! | `POST` | `/api/upload` | Single-request upload (multipart `file`, `description`) |
//! | `GET`  | `/api/upload/progress/{upload_id}` | Byte progress of a single-request upload |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Every `/api` route requires `Authorization: Bearer <token>`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "chunks_incomplete", "message": "chunks incomplete: received 0 of 1" } }
//! ```
//!
//! Codes: `bad_request`, `invalid_chunk_index`, `chunk_too_large` (400),
//! `unauthorized` (401), `forbidden` (403), `not_found` (404),
//! `chunks_incomplete`, `invalid_state` (409), `io_error` (500),
//! `resource_error` (502).

use std::io;
use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use resource_share_core::classify::{file_type_for, normalized_extension};
use resource_share_core::models::{NewResource, UploadTask};
use resource_share_core::UploadError;

use crate::auth::{bearer_token, AuthError, Authenticator, Caller, TokenSigner};
use crate::chunks::{remove_file_if_exists, ChunkStorage};
use crate::config::Config;
use crate::engine::{CancelOutcome, ChunkReceipt, EngineSettings, InitUpload, UploadEngine};
use crate::progress::{ProgressReader, ProgressReport, ProgressTracker};
use crate::registry::TaskRegistry;
use crate::sqlite_store::{SqliteResourceStore, SqliteTaskStore};
use crate::{db, migrate};

/// Multipart framing allowance on top of `max_upload_size`.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<UploadEngine>,
    pub progress: Arc<ProgressTracker>,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<UploadEngine>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            progress: Arc::new(ProgressTracker::new()),
            auth,
        }
    }
}

/// Wires the SQLite stores, chunk storage and token signer for `config`.
///
/// Creates the schema and storage directories if they are missing. Does
/// not recover tasks; see [`run_server`].
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let registry = Arc::new(TaskRegistry::new(
        Arc::new(SqliteTaskStore::new(pool.clone())),
        config.upload.retention(),
    ));
    let storage = ChunkStorage::new(config.storage.chunk_dir(), config.storage.upload_dir.clone());
    storage.ensure_dirs().await.with_context(|| {
        format!(
            "Failed to create storage directories under {}",
            config.storage.upload_dir.display()
        )
    })?;

    let engine = Arc::new(UploadEngine::new(
        registry,
        storage,
        Arc::new(SqliteResourceStore::new(pool)),
        EngineSettings::from(&config.upload),
    ));
    let signer = TokenSigner::new(&config.auth.secret, config.auth.token_ttl())?;

    Ok(AppState::new(config.clone(), engine, Arc::new(signer)))
}

/// Builds the router with CORS, request tracing and the body limit applied.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .config
        .upload
        .max_upload_size
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/upload", post(handle_simple_upload))
        .route("/api/upload/init", post(handle_init))
        .route("/api/upload/chunk", post(handle_chunk))
        .route("/api/upload/complete", post(handle_complete))
        .route("/api/upload/status/{task_id}", get(handle_status))
        .route("/api/upload/tasks", get(handle_tasks))
        .route("/api/upload/cancel/{task_id}", delete(handle_cancel))
        .route("/api/upload/progress/{upload_id}", get(handle_progress))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the upload server.
///
/// Runs migrations, reloads persisted tasks and re-dispatches any that were
/// interrupted mid-pipeline, then serves on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let resumed = state.engine.recover().await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, resumed, "Upload server listening");
    println!("Upload server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that renders as the JSON error contract.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let (status, code) = match &err {
            UploadError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            UploadError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            UploadError::ChunksIncomplete { .. } => (StatusCode::CONFLICT, "chunks_incomplete"),
            UploadError::InvalidChunkIndex { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_chunk_index")
            }
            UploadError::ChunkTooLarge { .. } => (StatusCode::BAD_REQUEST, "chunk_too_large"),
            UploadError::InvalidTransition { .. } | UploadError::UnexpectedStatus { .. } => {
                (StatusCode::CONFLICT, "invalid_state")
            }
            UploadError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            UploadError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            UploadError::Resource(_) => (StatusCode::BAD_GATEWAY, "resource_error"),
        };
        ApiError::new(status, code, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    bad_request(format!("invalid multipart body: {}", err))
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = bearer_token(header)?;
        Ok(state.auth.authenticate(token)?)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/upload/init ============

#[derive(Serialize)]
struct InitResponse {
    task_id: String,
    chunk_size: u64,
    total_chunks: u32,
}

async fn handle_init(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<InitUpload>,
) -> Result<Json<InitResponse>, ApiError> {
    let task = state.engine.init_upload(&caller, request).await?;
    Ok(Json(InitResponse {
        task_id: task.id,
        chunk_size: task.chunk_size,
        total_chunks: task.total_chunks,
    }))
}

// ============ POST /api/upload/chunk ============

/// Streams the `chunk` field straight to chunk storage. The `task_id` and
/// `chunk_index` fields must come before it.
async fn handle_chunk(
    State(state): State<AppState>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<Json<ChunkReceipt>, ApiError> {
    let mut task_id: Option<String> = None;
    let mut chunk_index: Option<u32> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "task_id" => task_id = Some(field.text().await.map_err(multipart_error)?),
            "chunk_index" => {
                let raw = field.text().await.map_err(multipart_error)?;
                let index = raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| bad_request(format!("invalid chunk_index: '{}'", raw)))?;
                chunk_index = Some(index);
            }
            "chunk" => {
                let (Some(task_id), Some(index)) = (task_id.as_deref(), chunk_index) else {
                    return Err(bad_request(
                        "task_id and chunk_index must precede the chunk field",
                    ));
                };
                let body = StreamReader::new(field.map_err(io::Error::other));
                let body = std::pin::pin!(body);
                let receipt = state
                    .engine
                    .receive_chunk(task_id, index, &caller, body)
                    .await?;
                return Ok(Json(receipt));
            }
            _ => {}
        }
    }

    Err(bad_request("missing chunk field"))
}

// ============ POST /api/upload/complete ============

#[derive(Deserialize)]
struct CompleteRequest {
    task_id: String,
}

#[derive(Serialize)]
struct CompleteResponse {
    task_id: String,
    status: String,
}

async fn handle_complete(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let task = state
        .engine
        .complete_upload(&request.task_id, &caller)
        .await?;
    Ok(Json(CompleteResponse {
        task_id: task.id,
        status: task.status.to_string(),
    }))
}

// ============ GET /api/upload/status/{task_id} ============

async fn handle_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<String>,
) -> Result<Json<UploadTask>, ApiError> {
    Ok(Json(state.engine.status(&task_id, &caller).await?))
}

// ============ GET /api/upload/tasks ============

#[derive(Serialize)]
struct TaskListResponse {
    tasks: Vec<UploadTask>,
}

async fn handle_tasks(State(state): State<AppState>, caller: Caller) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        tasks: state.engine.list_tasks(&caller).await,
    })
}

// ============ DELETE /api/upload/cancel/{task_id} ============

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn handle_cancel(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = match state.engine.cancel(&task_id, &caller).await? {
        CancelOutcome::Cancelled => "upload cancelled",
        CancelOutcome::AlreadyGone => "task already gone",
    };
    Ok(Json(MessageResponse {
        message: message.to_string(),
    }))
}

// ============ POST /api/upload ============

#[derive(Debug, Serialize)]
struct SimpleUploadResponse {
    id: i64,
    category: String,
    message: String,
    upload_id: String,
}

/// A file written by the single-request path.
struct StoredUpload {
    path: std::path::PathBuf,
    stored_name: String,
    original_name: String,
    size: u64,
}

/// Cleanup owed by a single-request upload, run when the handler future is
/// dropped. Covers every exit including a client disconnect, where the
/// future is dropped mid-await: the progress entry always gets its expiry,
/// and a file that was written but never registered is removed.
struct SimpleUploadGuard {
    progress: Arc<ProgressTracker>,
    upload_id: String,
    ttl: std::time::Duration,
    /// Written to disk but not yet owned by a resource row.
    unregistered: Option<std::path::PathBuf>,
}

impl Drop for SimpleUploadGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(path) = self.unregistered.take() {
            self.progress.abandon(&self.upload_id, "上传中断");
            runtime.spawn(async move { discard_partial(&path).await });
        }
        self.progress
            .schedule_expiry(self.upload_id.clone(), self.ttl);
    }
}

/// Single-request upload with byte progress under an upload id.
///
/// The id comes from the `X-Upload-Id` header so a client can poll
/// progress while the request is still streaming; one is generated when
/// the header is absent. The progress entry is dropped `progress_ttl_secs`
/// after the request finishes, however it finishes.
async fn handle_simple_upload(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<SimpleUploadResponse>, ApiError> {
    let upload_id = headers
        .get("x-upload-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let mut guard = SimpleUploadGuard {
        progress: Arc::clone(&state.progress),
        upload_id: upload_id.clone(),
        ttl: state.config.upload.progress_ttl(),
        unregistered: None,
    };
    simple_upload(&state, &caller, &mut guard, declared_size, multipart)
        .await
        .map(Json)
}

async fn simple_upload(
    state: &AppState,
    caller: &Caller,
    guard: &mut SimpleUploadGuard,
    declared_size: u64,
    mut multipart: Multipart,
) -> Result<SimpleUploadResponse, ApiError> {
    let upload_id = guard.upload_id.clone();
    let upload_id = upload_id.as_str();
    let mut description = String::new();
    let mut stored: Option<StoredUpload> = None;

    let fields = read_simple_fields(
        state,
        caller,
        guard,
        declared_size,
        &mut multipart,
        &mut description,
        &mut stored,
    )
    .await;
    if let Err(err) = fields {
        if let Some(stored) = &stored {
            tracing::warn!(upload_id, error = %err.message, "Upload form rejected after file was stored");
            discard_partial(&stored.path).await;
            state.progress.fail(upload_id, "读取表单失败");
        }
        guard.unregistered = None;
        return Err(err);
    }

    let stored = stored.ok_or_else(|| bad_request("读取文件失败"))?;
    let file_type = file_type_for(&stored.original_name);
    let category = file_type.category();

    let record = NewResource {
        name: stored.stored_name.clone(),
        original_name: stored.original_name.clone(),
        size: stored.size,
        category: category.to_string(),
        description,
        file_path: stored.path.to_string_lossy().into_owned(),
        file_type: file_type.as_str().to_string(),
        owner_id: caller.user_id,
    };
    let id = match state.engine.resources().insert(&record).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(upload_id, error = %e, "Resource insert failed");
            discard_partial(&stored.path).await;
            guard.unregistered = None;
            state.progress.fail(upload_id, "数据库写入失败");
            return Err(UploadError::Resource(e.to_string()).into());
        }
    };
    guard.unregistered = None;

    state.progress.complete(upload_id, stored.size);
    tracing::info!(
        upload_id,
        resource_id = id,
        owner_id = caller.user_id,
        size = stored.size,
        category,
        "Simple upload completed"
    );

    Ok(SimpleUploadResponse {
        id,
        category: category.to_string(),
        message: "上传成功".to_string(),
        upload_id: upload_id.to_string(),
    })
}

/// Reads the form, storing the first `file` field as it streams past.
/// `stored` is set as soon as the file is on disk, so the caller can clean
/// it up when a later field fails.
async fn read_simple_fields(
    state: &AppState,
    caller: &Caller,
    guard: &mut SimpleUploadGuard,
    declared_size: u64,
    multipart: &mut Multipart,
    description: &mut String,
    stored: &mut Option<StoredUpload>,
) -> Result<(), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "description" => *description = field.text().await.map_err(multipart_error)?,
            "file" if stored.is_none() => {
                let original_name = field.file_name().unwrap_or("upload").to_string();
                *stored = Some(
                    store_simple_file(state, caller, guard, original_name, declared_size, field)
                        .await?,
                );
            }
            _ => {}
        }
    }
    Ok(())
}

async fn store_simple_file(
    state: &AppState,
    caller: &Caller,
    guard: &mut SimpleUploadGuard,
    original_name: String,
    declared_size: u64,
    field: axum::extract::multipart::Field<'_>,
) -> Result<StoredUpload, ApiError> {
    let upload_id = guard.upload_id.clone();
    let upload_id = upload_id.as_str();
    let stored_name = match normalized_extension(&original_name) {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    };
    let path = state.engine.storage().upload_root().join(&stored_name);
    let limit = state.config.upload.max_upload_size;

    state
        .progress
        .start(upload_id, caller.user_id, &original_name, declared_size);
    let tracker = Arc::clone(&state.progress);
    let id = upload_id.to_string();
    let body = StreamReader::new(field.map_err(io::Error::other));
    let reader = ProgressReader::new(body, move |n| tracker.update(&id, n));
    let reader = std::pin::pin!(reader.take(limit.saturating_add(1)));

    let file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(upload_id, error = %e, "Cannot create upload file");
            state.progress.fail(upload_id, "创建文件失败");
            return Err(UploadError::Io(e).into());
        }
    };
    guard.unregistered = Some(path.clone());

    let written = match copy_to_file(reader, file).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(upload_id, error = %e, "Upload stream failed");
            discard_partial(&path).await;
            guard.unregistered = None;
            state.progress.fail(upload_id, "保存文件失败");
            return Err(UploadError::Io(e).into());
        }
    };
    if written > limit {
        discard_partial(&path).await;
        guard.unregistered = None;
        state.progress.fail(upload_id, "文件大小超过上传限制");
        return Err(bad_request(format!(
            "file exceeds the upload limit of {} bytes",
            limit
        )));
    }

    Ok(StoredUpload {
        path,
        stored_name,
        original_name,
        size: written,
    })
}

async fn copy_to_file<R>(mut reader: R, file: tokio::fs::File) -> io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = BufWriter::new(file);
    let written = tokio::io::copy(&mut reader, &mut out).await?;
    out.flush().await?;
    Ok(written)
}

async fn discard_partial(path: &FsPath) {
    if let Err(e) = remove_file_if_exists(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial upload");
    }
}

// ============ GET /api/upload/progress/{upload_id} ============

async fn handle_progress(
    State(state): State<AppState>,
    caller: Caller,
    Path(upload_id): Path<String>,
) -> Result<Json<ProgressReport>, ApiError> {
    let entry = state
        .progress
        .get(&upload_id)
        .ok_or_else(|| not_found("upload not found"))?;
    if entry.owner_id != caller.user_id && !caller.is_admin() {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!("upload {} belongs to another user", upload_id),
        ));
    }
    Ok(Json(entry.report(&upload_id)))
}
