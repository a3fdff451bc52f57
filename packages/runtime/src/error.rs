// ABOUTME: Error type for the run engine
// ABOUTME: Wraps storage, sandbox and filesystem failures surfaced to callers

use kernel_sandbox::SandboxError;
use kernel_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Storage(StorageError::NotFound(_)) | Self::ArtifactNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
