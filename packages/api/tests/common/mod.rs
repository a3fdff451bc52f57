// ABOUTME: Shared fixtures for API integration tests
// ABOUTME: Router over in-memory SQLite with a sandbox that prints fixed output

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use kernel_api::{create_router, AppState};
use kernel_runtime::{EngineSettings, LocalArtifactStore, RunManager};
use kernel_sandbox::{
    CodeOutcome, LineSender, OutputLine, Result, SandboxClient, SandboxFile, SandboxHandle,
};
use kernel_security::SecretCipher;
use kernel_storage::SqliteStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const TEST_SECRET_KEY: &str = "api-test-key";

/// Prints two lines and leaves one file in the output directory.
pub struct EchoSandbox;

#[async_trait]
impl SandboxClient for EchoSandbox {
    async fn create(&self, _env: &HashMap<String, String>) -> Result<SandboxHandle> {
        Ok(SandboxHandle {
            id: "echo".to_string(),
        })
    }

    async fn install(
        &self,
        _sandbox: &SandboxHandle,
        _packages: &[String],
        _lines: LineSender,
    ) -> Result<()> {
        Ok(())
    }

    async fn run_code(
        &self,
        _sandbox: &SandboxHandle,
        _code: &str,
        lines: LineSender,
    ) -> Result<CodeOutcome> {
        let _ = lines.send(OutputLine::stdout("hello"));
        let _ = lines.send(OutputLine::stderr("careful"));
        Ok(CodeOutcome { error: None })
    }

    async fn make_dir(&self, _sandbox: &SandboxHandle, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn list_files(&self, _sandbox: &SandboxHandle, _dir: &str) -> Result<Vec<SandboxFile>> {
        Ok(vec![SandboxFile {
            name: "status.txt".to_string(),
            is_dir: false,
        }])
    }

    async fn read_file(&self, _sandbox: &SandboxHandle, _path: &str) -> Result<Vec<u8>> {
        Ok(b"Agent run successful.".to_vec())
    }

    async fn destroy(&self, _sandbox: &SandboxHandle) -> Result<()> {
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub manager: RunManager,
    pub store: SqliteStore,
    pub artifacts_dir: TempDir,
}

pub async fn app(with_cipher: bool, sse_max_per_ip: usize) -> TestApp {
    let pool = kernel_storage::connect("sqlite::memory:").await.unwrap();
    let store = SqliteStore::new(pool);
    let artifacts_dir = TempDir::new().unwrap();
    let cipher = with_cipher.then(|| SecretCipher::from_secret_key(TEST_SECRET_KEY).unwrap());

    let manager = RunManager::new(
        store.clone(),
        Arc::new(EchoSandbox),
        cipher.clone(),
        LocalArtifactStore::new(artifacts_dir.path()),
        EngineSettings::default(),
    );
    let router = create_router(AppState::new(manager.clone(), cipher, sse_max_per_ip));

    TestApp {
        router,
        manager,
        store,
        artifacts_dir,
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

pub async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

pub async fn send_json(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

pub async fn wait_until_finished(manager: &RunManager, run_id: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.is_active(run_id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run did not finish");
}
