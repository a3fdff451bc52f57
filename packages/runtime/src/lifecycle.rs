// ABOUTME: Execution lifecycle of a single run, one handler per stage
// ABOUTME: Drives the sandbox, relays output to viewers and persists logs in batches

use chrono::Utc;
use futures::FutureExt;
use kernel_sandbox::{OutputLine, SandboxClient, SandboxError, SandboxHandle, StreamType};
use kernel_storage::{RunRecord, RunStatus, RunStore};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::artifacts::LocalArtifactStore;
use crate::error::Result;
use crate::flush::LogBuffer;
use crate::manager::EngineSettings;
use crate::registry::{LiveRun, RunRegistry};

/// Everything needed to execute one run. The code version is already resolved.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run: RunRecord,
    pub agent_name: String,
    pub code: String,
    pub dependencies: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Collaborators shared by every lifecycle.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub runs: Arc<dyn RunStore>,
    pub sandbox: Arc<dyn SandboxClient>,
    pub artifacts: LocalArtifactStore,
    pub registry: RunRegistry,
    pub settings: Arc<EngineSettings>,
}

#[derive(Debug)]
enum Stage {
    Starting,
    Provisioning,
    InstallingDependencies(SandboxHandle),
    Executing(SandboxHandle),
    CollectingArtifacts(SandboxHandle),
    TearingDown(SandboxHandle),
    Terminal,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Provisioning => "provisioning",
            Self::InstallingDependencies(_) => "installing_dependencies",
            Self::Executing(_) => "executing",
            Self::CollectingArtifacts(_) => "collecting_artifacts",
            Self::TearingDown(_) => "tearing_down",
            Self::Terminal => "terminal",
        }
    }
}

/// Register the run and spawn its lifecycle. Returns `false` if the run is already active.
pub(crate) async fn launch(ctx: EngineContext, request: RunRequest) -> bool {
    let run_id = request.run.id.clone();
    let live = Arc::new(LiveRun::new(&run_id, ctx.settings.subscriber_capacity));

    if !ctx.registry.insert(live.clone()).await {
        debug!(run_id = %run_id, "Run already active, ignoring start");
        return false;
    }

    let registry = ctx.registry.clone();
    let watched = live.clone();
    let lifecycle = Lifecycle::new(ctx, live.clone(), request);

    let handle = tokio::spawn(async move {
        if AssertUnwindSafe(lifecycle.drive()).catch_unwind().await.is_err() {
            // Viewers must still see a completion marker
            error!(run_id = %watched.run_id, "Run lifecycle panicked");
            watched.broadcast.close();
            registry.remove(&watched.run_id).await;
        }
    });
    live.attach_task(handle);
    true
}

struct Lifecycle {
    ctx: EngineContext,
    live: Arc<LiveRun>,
    run: RunRecord,
    agent_name: String,
    code: String,
    dependencies: Vec<String>,
    env: HashMap<String, String>,
    buffer: LogBuffer,
    /// Saved artifact names, written to the record at finalization
    artifacts: Vec<String>,
    /// Set by platform failures; user code errors never set it
    infra_failed: bool,
}

impl Lifecycle {
    fn new(ctx: EngineContext, live: Arc<LiveRun>, request: RunRequest) -> Self {
        Self {
            ctx,
            live,
            run: request.run,
            agent_name: request.agent_name,
            code: request.code,
            dependencies: request.dependencies,
            env: request.env,
            buffer: LogBuffer::new(),
            artifacts: Vec::new(),
            infra_failed: false,
        }
    }

    async fn drive(mut self) {
        let mut stage = Stage::Starting;
        loop {
            debug!(run_id = %self.run.id, stage = stage.name(), "Entering stage");
            stage = match stage {
                Stage::Starting => self.start().await,
                Stage::Provisioning => self.provision().await,
                Stage::InstallingDependencies(sandbox) => self.install_dependencies(sandbox).await,
                Stage::Executing(sandbox) => self.execute(sandbox).await,
                Stage::CollectingArtifacts(sandbox) => self.collect_artifacts(sandbox).await,
                Stage::TearingDown(sandbox) => self.tear_down(sandbox).await,
                Stage::Terminal => {
                    self.finish().await;
                    return;
                }
            };
        }
    }

    // ===== STAGES =====

    async fn start(&mut self) -> Stage {
        self.run.status = RunStatus::Running;
        self.run.start_time = Some(Utc::now());

        if let Err(e) = self.ctx.runs.commit_run(&self.run).await {
            error!(run_id = %self.run.id, "Failed to mark run as running: {}", e);
            self.emit(format!("[SYSTEM] Error: {}", e));
            self.infra_failed = true;
            return Stage::Terminal;
        }

        info!(run_id = %self.run.id, agent = %self.agent_name, "Run started");
        self.emit(format!("[SYSTEM] Initializing Sandbox for Run {}...", self.run.id));
        Stage::Provisioning
    }

    async fn provision(&mut self) -> Stage {
        let sandbox = self.ctx.sandbox.clone();
        match sandbox.create(&self.env).await {
            Ok(handle) => {
                self.emit("[SYSTEM] Sandbox started.");
                self.flush_if_due().await;
                Stage::InstallingDependencies(handle)
            }
            Err(e) => {
                error!(run_id = %self.run.id, "Failed to create sandbox: {}", e);
                self.emit(format!("[SYSTEM] Failed to create sandbox: {}", e));
                self.infra_failed = true;
                Stage::Terminal
            }
        }
    }

    async fn install_dependencies(&mut self, handle: SandboxHandle) -> Stage {
        if self.dependencies.is_empty() {
            return Stage::Executing(handle);
        }

        self.emit(format!("[SYSTEM] Installing: {}", self.dependencies.join(" ")));
        self.flush().await;

        let sandbox = self.ctx.sandbox.clone();
        let packages = self.dependencies.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let result = self.relay(sandbox.install(&handle, &packages, tx), rx).await;

        // Policy: a failed install is reported and execution still proceeds.
        // The code may not need the package that failed.
        if let Err(e) = result {
            warn!(run_id = %self.run.id, "Dependency installation failed: {}", e);
            self.emit(format!("[SYSTEM] Dependency installation failed: {}", e));
        }

        Stage::Executing(handle)
    }

    async fn execute(&mut self, handle: SandboxHandle) -> Stage {
        let sandbox = self.ctx.sandbox.clone();

        if let Err(e) = sandbox.make_dir(&handle, &self.ctx.settings.output_dir).await {
            return self.sandbox_failure(e, handle);
        }

        self.emit("[SYSTEM] Executing code...");
        self.flush().await;

        let code = self.code.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = match self.relay(sandbox.run_code(&handle, &code, tx), rx).await {
            Ok(outcome) => outcome,
            Err(e) => return self.sandbox_failure(e, handle),
        };

        match outcome.error {
            Some(err) => {
                info!(run_id = %self.run.id, "User code raised {}", err.name);
                self.emit(format!("[ERROR] {}: {}", err.name, err.message));
                for line in err.traceback {
                    self.emit(line);
                }
            }
            None => self.emit("[SYSTEM] Execution completed successfully."),
        }
        self.flush_if_due().await;

        Stage::CollectingArtifacts(handle)
    }

    async fn collect_artifacts(&mut self, handle: SandboxHandle) -> Stage {
        if let Err(e) = self.save_artifacts(&handle).await {
            warn!(run_id = %self.run.id, "Error saving artifacts: {}", e);
            self.emit(format!("[SYSTEM] Error saving artifacts: {}", e));
        }
        Stage::TearingDown(handle)
    }

    async fn tear_down(&mut self, handle: SandboxHandle) -> Stage {
        if let Err(e) = self.ctx.sandbox.destroy(&handle).await {
            warn!(run_id = %self.run.id, "Failed to tear down sandbox {}: {}", handle.id, e);
        }
        Stage::Terminal
    }

    /// Final flush and the single terminal write, then release viewers and the registry slot.
    async fn finish(&mut self) {
        if let Some(chunk) = self.buffer.take() {
            self.run.append_logs(&chunk);
        }

        self.run.status = if self.infra_failed {
            RunStatus::Error
        } else {
            RunStatus::Success
        };
        self.run.end_time = Some(Utc::now());
        self.run.artifacts_written = std::mem::take(&mut self.artifacts);

        match self.ctx.runs.commit_run(&self.run).await {
            Ok(()) => info!(
                run_id = %self.run.id,
                status = self.run.status.as_str(),
                "Run finished"
            ),
            Err(e) => error!(run_id = %self.run.id, "Error finalizing run: {}", e),
        }

        self.live.broadcast.close();
        self.ctx.registry.remove(&self.run.id).await;
    }

    // ===== HELPERS =====

    fn sandbox_failure(&mut self, e: SandboxError, handle: SandboxHandle) -> Stage {
        error!(run_id = %self.run.id, "Sandbox error: {}", e);
        self.emit(format!("[SYSTEM] Sandbox Error: {}", e));
        self.infra_failed = true;
        Stage::TearingDown(handle)
    }

    async fn save_artifacts(&mut self, handle: &SandboxHandle) -> Result<()> {
        let sandbox = self.ctx.sandbox.clone();
        let dir = self.ctx.settings.output_dir.trim_end_matches('/').to_string();

        let files: Vec<_> = sandbox
            .list_files(handle, &dir)
            .await?
            .into_iter()
            .filter(|file| !file.is_dir)
            .collect();

        if !files.is_empty() {
            self.emit(format!("[SYSTEM] Found {} artifacts.", files.len()));
        }

        for file in files {
            let content = sandbox
                .read_file(handle, &format!("{}/{}", dir, file.name))
                .await?;
            self.ctx
                .artifacts
                .save(&self.agent_name, &self.run.id, &file.name, &content)
                .await?;

            self.emit(format!("[SYSTEM] Saved artifact: {}", file.name));
            self.artifacts.push(file.name);
            self.flush_if_due().await;
        }
        Ok(())
    }

    /// Await a sandbox call while relaying its output lines and flushing on schedule.
    async fn relay<T>(
        &mut self,
        op: impl Future<Output = T>,
        mut lines: mpsc::UnboundedReceiver<OutputLine>,
    ) -> T {
        tokio::pin!(op);

        let period = self.ctx.settings.flush.interval;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(line) = lines.recv() => {
                    self.emit_output(line);
                    self.flush_if_due().await;
                }
                _ = tick.tick() => self.flush_if_due().await,
                outcome = &mut op => break outcome,
            }
        };

        // Lines sent just before the call returned
        while let Ok(line) = lines.try_recv() {
            self.emit_output(line);
        }
        self.flush_if_due().await;

        outcome
    }

    fn emit_output(&mut self, line: OutputLine) {
        let prefix = match line.stream {
            StreamType::Stdout => "[STDOUT]",
            StreamType::Stderr => "[STDERR]",
        };
        self.emit(format!("{} {}", prefix, line.text));
    }

    /// Publish to viewers and queue for persistence.
    fn emit(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.live.broadcast.publish(line.clone());
        self.buffer.push(line);
    }

    async fn flush_if_due(&mut self) {
        if self.buffer.is_due(&self.ctx.settings.flush) {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        let Some(chunk) = self.buffer.take() else {
            return;
        };
        self.run.append_logs(&chunk);

        // The in-memory record keeps the text, so a failed write is retried by the next commit
        if let Err(e) = self.ctx.runs.commit_run(&self.run).await {
            warn!(run_id = %self.run.id, "Failed to persist logs: {}", e);
        }
    }
}
