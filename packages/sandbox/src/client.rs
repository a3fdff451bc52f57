// ABOUTME: Sandbox client trait consumed by the run engine
// ABOUTME: Defines sandbox handles, streamed output lines, code outcomes and file listings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Opaque reference to a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// One complete line of sandbox output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamType,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: StreamType::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: StreamType::Stderr,
            text: text.into(),
        }
    }
}

/// Output callback. A dropped receiver is not an error for the sender.
pub type LineSender = mpsc::UnboundedSender<OutputLine>;

/// An exception raised by the user's code inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeOutcome {
    /// Set when the code itself failed; infrastructure failures are returned as `Err`
    pub error: Option<ExecutionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    pub name: String,
    pub is_dir: bool,
}

/// Isolated execution environment for untrusted code.
///
/// Timeouts are the implementation's concern; the engine awaits each call as-is.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Provision a sandbox with the given environment variables.
    async fn create(&self, env: &HashMap<String, String>) -> Result<SandboxHandle>;

    /// Install packages, relaying installer output through `lines`.
    async fn install(
        &self,
        sandbox: &SandboxHandle,
        packages: &[String],
        lines: LineSender,
    ) -> Result<()>;

    /// Execute code, relaying stdout and stderr through `lines` as they arrive.
    async fn run_code(
        &self,
        sandbox: &SandboxHandle,
        code: &str,
        lines: LineSender,
    ) -> Result<CodeOutcome>;

    /// Create a directory (and parents) inside the sandbox.
    async fn make_dir(&self, sandbox: &SandboxHandle, path: &str) -> Result<()>;

    async fn list_files(&self, sandbox: &SandboxHandle, dir: &str) -> Result<Vec<SandboxFile>>;

    async fn read_file(&self, sandbox: &SandboxHandle, path: &str) -> Result<Vec<u8>>;

    /// Tear the sandbox down.
    async fn destroy(&self, sandbox: &SandboxHandle) -> Result<()>;
}
