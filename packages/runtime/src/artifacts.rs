// ABOUTME: Local filesystem storage for files produced by runs
// ABOUTME: Layout is <root>/<agent name>/<run id>/<file name>, every segment reduced to a base name

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, agent_name: &str, run_id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(base_name(agent_name)?)
            .join(base_name(run_id)?))
    }

    /// Write a file and return where it landed.
    pub async fn save(
        &self,
        agent_name: &str,
        run_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.run_dir(agent_name, run_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(base_name(filename)?);
        tokio::fs::write(&path, content).await?;

        info!("Saved artifact {} ({} bytes)", path.display(), content.len());
        Ok(path)
    }

    /// File names stored for a run, sorted. Empty if the run saved nothing.
    pub async fn list(&self, agent_name: &str, run_id: &str) -> Result<Vec<String>> {
        let dir = self.run_dir(agent_name, run_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn read(&self, agent_name: &str, run_id: &str, filename: &str) -> Result<Vec<u8>> {
        let name = base_name(filename)?;
        let path = self.run_dir(agent_name, run_id)?.join(&name);

        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RuntimeError::ArtifactNotFound(name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Strip any directory components, rejecting names that reduce to nothing.
pub fn base_name(name: &str) -> Result<String> {
    // Treat backslashes as separators too
    let normalized = name.replace('\\', "/");
    match Path::new(&normalized).file_name() {
        Some(base) => Ok(base.to_string_lossy().to_string()),
        None => Err(RuntimeError::InvalidArtifactName(name.to_string())),
    }
}
