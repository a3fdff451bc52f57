// ABOUTME: Shared fixtures for run engine integration tests
// ABOUTME: Scripted in-process sandbox and an engine wired to in-memory SQLite

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use kernel_runtime::{
    EngineSettings, EventStream, FlushPolicy, LocalArtifactStore, RunManager, StreamEvent,
};
use kernel_sandbox::{
    CodeOutcome, ExecutionError, LineSender, OutputLine, Result, SandboxClient, SandboxError,
    SandboxFile, SandboxHandle,
};
use kernel_storage::{RunRecord, SqliteStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Sandbox whose behaviour is fixed up front.
///
/// When `gate` is set, each code output line waits for one permit, letting a test
/// attach viewers at precise points in the run.
#[derive(Default)]
pub struct ScriptedSandbox {
    pub create_error: Option<String>,
    pub install_error: Option<String>,
    pub install_lines: Vec<String>,
    pub code_lines: Vec<OutputLine>,
    pub code_error: Option<ExecutionError>,
    pub run_error: Option<String>,
    pub files: Vec<(String, Vec<u8>)>,
    pub gate: Option<Arc<Semaphore>>,
    pub created_env: Mutex<Option<HashMap<String, String>>>,
    pub installs: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn printing(lines: &[&str]) -> Self {
        Self {
            code_lines: lines.iter().map(|l| OutputLine::stdout(*l)).collect(),
            ..Default::default()
        }
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn env(&self) -> HashMap<String, String> {
        self.created_env.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl SandboxClient for ScriptedSandbox {
    async fn create(&self, env: &HashMap<String, String>) -> Result<SandboxHandle> {
        if let Some(message) = &self.create_error {
            return Err(SandboxError::Connection(message.clone()));
        }
        *self.created_env.lock().unwrap() = Some(env.clone());
        Ok(SandboxHandle {
            id: "scripted-sandbox".to_string(),
        })
    }

    async fn install(
        &self,
        _sandbox: &SandboxHandle,
        _packages: &[String],
        lines: LineSender,
    ) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        for line in &self.install_lines {
            let _ = lines.send(OutputLine::stdout(line.clone()));
        }
        match &self.install_error {
            Some(message) => Err(SandboxError::Command(message.clone())),
            None => Ok(()),
        }
    }

    async fn run_code(
        &self,
        _sandbox: &SandboxHandle,
        _code: &str,
        lines: LineSender,
    ) -> Result<CodeOutcome> {
        for line in &self.code_lines {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let _ = lines.send(line.clone());
            tokio::task::yield_now().await;
        }
        if let Some(message) = &self.run_error {
            return Err(SandboxError::Container(message.clone()));
        }
        Ok(CodeOutcome {
            error: self.code_error.clone(),
        })
    }

    async fn make_dir(&self, _sandbox: &SandboxHandle, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn list_files(&self, _sandbox: &SandboxHandle, _dir: &str) -> Result<Vec<SandboxFile>> {
        let mut files: Vec<SandboxFile> = self
            .files
            .iter()
            .map(|(name, _)| SandboxFile {
                name: name.clone(),
                is_dir: false,
            })
            .collect();
        files.push(SandboxFile {
            name: "cache".to_string(),
            is_dir: true,
        });
        Ok(files)
    }

    async fn read_file(&self, _sandbox: &SandboxHandle, path: &str) -> Result<Vec<u8>> {
        self.files
            .iter()
            .find(|(name, _)| path.ends_with(&format!("/{}", name)))
            .map(|(_, content)| content.clone())
            .ok_or_else(|| SandboxError::File(format!("no such file {}", path)))
    }

    async fn destroy(&self, _sandbox: &SandboxHandle) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestEngine {
    pub manager: RunManager,
    pub store: SqliteStore,
    pub sandbox: Arc<ScriptedSandbox>,
    pub artifacts_dir: TempDir,
}

pub async fn engine(sandbox: ScriptedSandbox) -> TestEngine {
    engine_with(sandbox, EngineSettings::default()).await
}

pub async fn engine_with(sandbox: ScriptedSandbox, settings: EngineSettings) -> TestEngine {
    let pool = kernel_storage::connect("sqlite::memory:").await.unwrap();
    let store = SqliteStore::new(pool);
    let sandbox = Arc::new(sandbox);
    let artifacts_dir = TempDir::new().unwrap();

    let manager = RunManager::new(
        store.clone(),
        sandbox.clone(),
        None,
        LocalArtifactStore::new(artifacts_dir.path()),
        settings,
    );

    TestEngine {
        manager,
        store,
        sandbox,
        artifacts_dir,
    }
}

pub fn settings_with_flush(max_lines: usize, interval: Duration) -> EngineSettings {
    EngineSettings {
        flush: FlushPolicy {
            max_lines,
            interval,
        },
        ..EngineSettings::default()
    }
}

/// Collect events until the completion marker.
pub async fn collect(stream: EventStream) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not complete")
}

pub fn line_texts(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Line(line) => Some(line.clone()),
            StreamEvent::Complete => None,
        })
        .collect()
}

/// Wait until the run has left the registry and return its stored record.
pub async fn wait_until_finished(engine: &TestEngine, run_id: &str) -> RunRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        while engine.manager.is_active(run_id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run did not finish");
    engine.store.get_run(run_id).await.unwrap()
}

pub async fn wait_for_line(stream: &mut EventStream, wanted: &str) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = stream.next().await {
            let done = matches!(&event, StreamEvent::Line(line) if line == wanted);
            seen.push(event);
            if done {
                return;
            }
        }
    })
    .await
    .expect("line never arrived");
    seen
}
