// ABOUTME: Entry point of the run engine owned by the service and shared with the API layer
// ABOUTME: Triggers runs, serves log streams and reconciles orphaned runs

use kernel_config::KernelConfig;
use kernel_sandbox::SandboxClient;
use kernel_security::SecretCipher;
use kernel_storage::{RunRecord, RunStore, SqliteStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::artifacts::LocalArtifactStore;
use crate::broadcast::EventStream;
use crate::error::Result;
use crate::flush::FlushPolicy;
use crate::lifecycle::{self, EngineContext, RunRequest};
use crate::reconciler;
use crate::registry::RunRegistry;

/// Trigger type recorded for runs started through the API.
pub const MANUAL_TRIGGER: &str = "manual";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub flush: FlushPolicy,
    /// Live backlog allowed per viewer before it is disconnected
    pub subscriber_capacity: usize,
    /// Sandbox directory collected as artifacts
    pub output_dir: String,
    /// Injected into every sandbox, overriding secrets of the same name
    pub platform_env: HashMap<String, String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            subscriber_capacity: kernel_config::settings::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            output_dir: kernel_config::settings::DEFAULT_SANDBOX_OUTPUT_DIR.to_string(),
            platform_env: HashMap::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            flush: FlushPolicy::from_config(config),
            subscriber_capacity: config.subscriber_queue_capacity,
            output_dir: config.sandbox_output_dir.clone(),
            platform_env: config.platform_env.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RunManager {
    store: SqliteStore,
    cipher: Option<SecretCipher>,
    ctx: EngineContext,
}

impl RunManager {
    pub fn new(
        store: SqliteStore,
        sandbox: Arc<dyn SandboxClient>,
        cipher: Option<SecretCipher>,
        artifacts: LocalArtifactStore,
        settings: EngineSettings,
    ) -> Self {
        let runs: Arc<dyn RunStore> = Arc::new(store.clone());
        Self {
            store,
            cipher,
            ctx: EngineContext {
                runs,
                sandbox,
                artifacts,
                registry: RunRegistry::new(),
                settings: Arc::new(settings),
            },
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn artifacts(&self) -> &LocalArtifactStore {
        &self.ctx.artifacts
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    /// Create a queued run of the agent's current version and start it.
    /// Returns immediately; the record moves to `running` asynchronously.
    pub async fn trigger(&self, agent_id: &str) -> Result<RunRecord> {
        let agent = self.store.get_agent(agent_id).await?;
        let env = self.resolve_env(agent_id).await?;

        let run = self.store.create_run(agent_id, MANUAL_TRIGGER, None).await?;
        let version = self.store.get_version(&run.version_id).await?;

        info!(run_id = %run.id, agent = %agent.name, version = %version.id, "Triggering run");
        self.start_run(RunRequest {
            run: run.clone(),
            agent_name: agent.name,
            dependencies: version.dependency_list(),
            code: version.code,
            env,
        })
        .await;

        Ok(run)
    }

    /// Start a lifecycle for an existing record. A run that is already active is left alone.
    pub async fn start_run(&self, request: RunRequest) -> bool {
        lifecycle::launch(self.ctx.clone(), request).await
    }

    /// Viewer stream for a run: live attach, zombie reconciliation or stored replay.
    pub async fn stream(&self, run_id: &str) -> Result<EventStream> {
        reconciler::open_stream(self.ctx.runs.as_ref(), &self.ctx.registry, run_id).await
    }

    /// Fail unfinished runs this process does not control. Meant for start-up,
    /// before any run has been triggered.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        reconciler::sweep(self.ctx.runs.as_ref(), &self.ctx.registry).await
    }

    pub async fn active_runs(&self) -> Vec<String> {
        self.ctx.registry.ids().await
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.ctx.registry.contains(run_id).await
    }

    /// Artifact names saved for a run.
    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>> {
        let agent_name = self.agent_name_for_run(run_id).await?;
        self.ctx.artifacts.list(&agent_name, run_id).await
    }

    pub async fn read_artifact(&self, run_id: &str, name: &str) -> Result<Vec<u8>> {
        let agent_name = self.agent_name_for_run(run_id).await?;
        self.ctx.artifacts.read(&agent_name, run_id, name).await
    }

    async fn agent_name_for_run(&self, run_id: &str) -> Result<String> {
        let run = self.store.get_run(run_id).await?;
        Ok(self.store.get_agent(&run.agent_id).await?.name)
    }

    /// Decrypted linked secrets merged with platform variables.
    /// A secret that cannot be decrypted is skipped, never fatal.
    async fn resolve_env(&self, agent_id: &str) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();

        let secrets = self.store.linked_secrets(agent_id).await?;
        match &self.cipher {
            Some(cipher) => {
                for secret in secrets {
                    match cipher.decrypt(&secret.value) {
                        Ok(value) => {
                            env.insert(secret.key, value);
                        }
                        Err(e) => warn!("Skipping secret {}: {}", secret.key, e),
                    }
                }
            }
            None if !secrets.is_empty() => {
                warn!(
                    "No secret key configured, {} linked secrets not injected",
                    secrets.len()
                );
            }
            None => {}
        }

        for (key, value) in &self.ctx.settings.platform_env {
            env.insert(key.clone(), value.clone());
        }
        Ok(env)
    }
}
