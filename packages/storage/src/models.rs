// ABOUTME: Record types for agents, code versions, secrets and runs
// ABOUTME: Status enums serialize as lowercase strings matching the database CHECK constraints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Result, StorageError};

/// Package list given to a fresh agent.
pub const DEFAULT_DEPENDENCIES: &str = "requests\n";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub schedule: Option<String>,
    pub description: Option<String>,
    pub current_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVersion {
    pub id: String,
    pub agent_id: String,
    pub code: String,
    /// Newline separated package specifiers
    pub dependencies: String,
    pub parent_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentVersion {
    /// Package specifiers with blank lines and comments removed.
    pub fn dependency_list(&self) -> Vec<String> {
        self.dependencies
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Durable record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub agent_id: String,
    /// Frozen at trigger time
    pub version_id: String,
    pub status: RunStatus,
    pub trigger_type: String,
    pub input_payload: Option<JsonValue>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub logs: String,
    pub artifacts_written: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append text to the stored transcript; prior content is never rewritten.
    pub fn append_logs(&mut self, chunk: &str) {
        self.logs.push_str(chunk);
    }
}

/// Stored secret; `value` holds ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub key: String,
    #[serde(skip_serializing)]
    pub value: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}
