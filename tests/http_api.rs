//! HTTP API tests against a server spawned on a free port.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;

use resource_share::auth::{Caller, TokenSigner};
use resource_share::chunks::ChunkStorage;
use resource_share::config::Config;
use resource_share::engine::{EngineSettings, UploadEngine};
use resource_share::registry::TaskRegistry;
use resource_share::server::{build_router, run_server, AppState};
use resource_share_core::models::NewResource;
use resource_share_core::store::memory::{InMemoryResourceStore, InMemoryTaskStore};
use resource_share_core::store::ResourceStore;

const SECRET: &str = "integration-secret";

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    base: String,
    client: Client,
    signer: TokenSigner,
    tmp: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let port = find_free_port();
        let cfg = Config::rooted_at(tmp.path(), &format!("127.0.0.1:{}", port), SECRET);

        tokio::spawn(async move {
            run_server(&cfg).await.ok();
        });
        wait_for_server(port).await;

        Self {
            base: format!("http://127.0.0.1:{}", port),
            client: Client::new(),
            signer: TokenSigner::new(SECRET, chrono::Duration::hours(1)).unwrap(),
            tmp,
        }
    }

    /// Serves a router over `engine` instead of the SQLite-backed one.
    async fn start_with_engine(tmp: TempDir, engine: Arc<UploadEngine>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = Config::rooted_at(tmp.path(), &format!("127.0.0.1:{}", port), SECRET);
        let signer = TokenSigner::new(SECRET, chrono::Duration::hours(1)).unwrap();
        let app = build_router(AppState::new(cfg, engine, Arc::new(signer.clone())));

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        wait_for_server(port).await;

        Self {
            base: format!("http://127.0.0.1:{}", port),
            client: Client::new(),
            signer,
            tmp,
        }
    }

    /// Regular files currently in the upload directory.
    fn stored_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.tmp.path().join("uploads")) else {
            return Vec::new();
        };
        entries
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_file())
            .collect()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn token(&self, caller: Caller) -> String {
        self.signer.issue(&caller)
    }

    async fn init(&self, token: &str, file_name: &str, size: u64) -> Value {
        let resp = self
            .client
            .post(self.url("/api/upload/init"))
            .bearer_auth(token)
            .json(&json!({ "file_name": file_name, "file_size": size }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        resp.json().await.unwrap()
    }

    async fn send_chunk(&self, token: &str, task_id: &str, index: u32, bytes: Vec<u8>) -> reqwest::Response {
        let form = Form::new()
            .text("task_id", task_id.to_string())
            .text("chunk_index", index.to_string())
            .part("chunk", Part::bytes(bytes).file_name("blob"));
        self.client
            .post(self.url("/api/upload/chunk"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn status(&self, token: &str, task_id: &str) -> reqwest::Response {
        self.client
            .get(self.url(&format!("/api/upload/status/{}", task_id)))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    async fn wait_for_status(&self, token: &str, task_id: &str, wanted: &str) -> Value {
        for _ in 0..100 {
            let body: Value = self.status(token, task_id).await.json().await.unwrap();
            if body["status"] == wanted {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never reached {}", task_id, wanted);
    }
}

/// Holds every insert until released.
struct GatedResourceStore {
    inner: InMemoryResourceStore,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ResourceStore for GatedResourceStore {
    async fn insert(&self, resource: &NewResource) -> Result<i64> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.insert(resource).await
    }
    async fn find_by_path(&self, file_path: &str) -> Result<Option<i64>> {
        self.inner.find_by_path(file_path).await
    }
    async fn remove(&self, resource_id: i64) -> Result<()> {
        self.inner.remove(resource_id).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_auth_required() {
    let server = TestServer::start().await;

    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = server
        .client
        .get(server.url("/api/upload/tasks"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let resp = server
        .client
        .get(server.url("/api/upload/tasks"))
        .bearer_auth("forged.token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_chunked_upload_round_trip() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(1));
    let bob = server.token(Caller::user(2));

    let init = server.init(&alice, "a.png", 1000).await;
    let task_id = init["task_id"].as_str().unwrap().to_string();
    assert_eq!(init["total_chunks"], 1);
    assert_eq!(init["chunk_size"], 1000);

    // Another user cannot add chunks or read the task.
    let resp = server.send_chunk(&bob, &task_id, 0, vec![1; 1000]).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(server.status(&bob, &task_id).await.status(), StatusCode::FORBIDDEN);

    let resp = server.send_chunk(&alice, &task_id, 0, vec![1; 1000]).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["uploaded_chunks"], 1);
    assert_eq!(receipt["progress"], 100);

    // Retrying the same chunk is harmless.
    let again: Value = server
        .send_chunk(&alice, &task_id, 0, vec![1; 1000])
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again["duplicate"], true);

    let resp = server
        .client
        .post(server.url("/api/upload/complete"))
        .bearer_auth(&alice)
        .json(&json!({ "task_id": task_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "merging");

    let done = server.wait_for_status(&alice, &task_id, "completed").await;
    assert_eq!(done["progress"], 100);
    assert_eq!(done["category"], "图片");
    assert!(done["resource_id"].is_i64());
    assert!(done["error"].is_null());

    let list: Value = server
        .client
        .get(server.url("/api/upload/tasks"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["tasks"].as_array().unwrap().len(), 1);
    let others: Value = server
        .client
        .get(server.url("/api/upload/tasks"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(others["tasks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_precondition_errors() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(1));

    let init = server.init(&alice, "a.zip", 10).await;
    let task_id = init["task_id"].as_str().unwrap().to_string();

    let resp = server
        .client
        .post(server.url("/api/upload/complete"))
        .bearer_auth(&alice)
        .json(&json!({ "task_id": task_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "chunks_incomplete");

    let resp = server.send_chunk(&alice, &task_id, 3, vec![0; 10]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_chunk_index");

    let resp = server.send_chunk(&alice, &task_id, 0, vec![0; 11]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "chunk_too_large");

    let resp = server.status(&alice, "no-such-task").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .post(server.url("/api/upload/init"))
        .bearer_auth(&alice)
        .json(&json!({ "file_name": "huge.iso", "file_size": 8u64 * 1024 * 1024 * 1024 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(1));
    let bob = server.token(Caller::user(2));

    let init = server.init(&alice, "a.zip", 10).await;
    let task_id = init["task_id"].as_str().unwrap().to_string();
    let cancel_url = server.url(&format!("/api/upload/cancel/{}", task_id));

    let resp = server.client.delete(&cancel_url).bearer_auth(&bob).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = server.client.delete(&cancel_url).bearer_auth(&alice).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "upload cancelled");

    let resp = server.client.delete(&cancel_url).bearer_auth(&alice).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "task already gone");

    assert_eq!(server.status(&alice, &task_id).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_simple_upload_reports_progress() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(9));
    let payload = vec![42u8; 64 * 1024];

    let form = Form::new()
        .text("description", "quarterly report")
        .part("file", Part::bytes(payload.clone()).file_name("report.pdf"));
    let resp = server
        .client
        .post(server.url("/api/upload"))
        .bearer_auth(&alice)
        .header("X-Upload-Id", "upload-1")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "上传成功");
    assert_eq!(body["category"], "文档");
    assert_eq!(body["upload_id"], "upload-1");
    assert!(body["id"].is_i64());

    let progress: Value = server
        .client
        .get(server.url("/api/upload/progress/upload-1"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["status"], "completed");
    assert_eq!(progress["uploaded"], payload.len() as u64);
    assert_eq!(progress["progress"], 100.0);
    assert_eq!(progress["file_name"], "report.pdf");

    let resp = server
        .client
        .get(server.url("/api/upload/progress/unknown"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_simple_upload_without_file_is_rejected() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(9));

    let form = Form::new().text("description", "nothing attached");
    let resp = server
        .client
        .post(server.url("/api/upload"))
        .bearer_auth(&alice)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_simple_upload_with_broken_trailing_field_leaves_nothing() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(9));

    // A complete `file` part followed by a `description` part whose
    // closing boundary never arrives.
    let body = concat!(
        "--XB\r\n",
        "Content-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\n",
        "Content-Type: image/png\r\n",
        "\r\n",
        "PNGDATA\r\n",
        "--XB\r\n",
        "Content-Disposition: form-data; name=\"description\"\r\n",
        "\r\n",
        "cut short",
    );
    let resp = server
        .client
        .post(server.url("/api/upload"))
        .bearer_auth(&alice)
        .header("X-Upload-Id", "broken-1")
        .header("Content-Type", "multipart/form-data; boundary=XB")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    assert!(server.stored_files().is_empty(), "left {:?}", server.stored_files());

    let progress: Value = server
        .client
        .get(server.url("/api/upload/progress/broken-1"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["status"], "error");
    assert!(!progress["error_message"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_is_private_to_the_uploader() {
    let server = TestServer::start().await;
    let alice = server.token(Caller::user(9));
    let bob = server.token(Caller::user(10));
    let admin = server.token(Caller::admin(1));

    let form = Form::new().part("file", Part::bytes(vec![1u8; 16]).file_name("a.txt"));
    let resp = server
        .client
        .post(server.url("/api/upload"))
        .bearer_auth(&alice)
        .header("X-Upload-Id", "mine")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let url = server.url("/api/upload/progress/mine");
    let resp = server.client.get(&url).bearer_auth(&bob).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = server.client.get(&url).bearer_auth(&admin).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cancel_while_processing_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let storage = ChunkStorage::new(tmp.path().join("chunks"), tmp.path().join("uploads"));
    storage.ensure_dirs().await.unwrap();
    let resources = Arc::new(GatedResourceStore {
        inner: InMemoryResourceStore::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let registry = Arc::new(TaskRegistry::new(
        Arc::new(InMemoryTaskStore::new()),
        chrono::Duration::hours(24),
    ));
    let engine = Arc::new(UploadEngine::new(
        registry,
        storage,
        resources.clone(),
        EngineSettings {
            chunk_size: 0,
            max_upload_size: 1024 * 1024,
        },
    ));
    let server = TestServer::start_with_engine(tmp, engine).await;
    let alice = server.token(Caller::user(4));

    let init = server.init(&alice, "track.mp3", 8).await;
    let task_id = init["task_id"].as_str().unwrap().to_string();
    let resp = server.send_chunk(&alice, &task_id, 0, b"ID3-data".to_vec()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server
        .client
        .post(server.url("/api/upload/complete"))
        .bearer_auth(&alice)
        .json(&json!({ "task_id": task_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    resources.entered.notified().await;
    let processing: Value = server.status(&alice, &task_id).await.json().await.unwrap();
    assert_eq!(processing["status"], "processing");
    assert_eq!(processing["category"], "音频");
    assert_eq!(server.stored_files().len(), 1);

    let resp = server
        .client
        .delete(server.url(&format!("/api/upload/cancel/{}", task_id)))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "upload cancelled");

    resources.release.notify_one();
    for _ in 0..100 {
        if server.stored_files().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.stored_files().is_empty());
    assert!(resources.inner.all().is_empty());
    assert_eq!(server.status(&alice, &task_id).await.status(), StatusCode::NOT_FOUND);
    let list: Value = server
        .client
        .get(server.url("/api/upload/tasks"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list["tasks"].as_array().unwrap().is_empty());
}
