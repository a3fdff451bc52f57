// ABOUTME: Agent and code version operations
// ABOUTME: Every code change creates a new immutable version linked to its parent

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;

use crate::models::{Agent, AgentStatus, AgentVersion, DEFAULT_DEPENDENCIES};
use crate::{map_unique_violation, new_id, parse_timestamp, Result, SqliteStore, StorageError};

/// Starter script for a freshly created agent; writes one artifact to the output directory.
pub fn default_agent_code(name: &str) -> String {
    format!(
        r#"import time
import os

print("Starting agent '{name}' initialization...")
print("Environment check: OK")

def task():
    print("Performing automated task...")
    time.sleep(1)
    print("Task data processed.")

    with open("/data/status.txt", "w") as f:
        f.write("Agent run successful.\nTimestamp: " + str(time.time()))
    print("Artifact 'status.txt' written.")

if __name__ == "__main__":
    task()
    print("Agent execution complete.")
"#
    )
}

const AGENT_COLUMNS: &str = "id, name, status, schedule, description, current_version_id, created_at, updated_at";
const VERSION_COLUMNS: &str = "id, agent_id, code, dependencies, parent_version_id, created_at";

impl SqliteStore {
    // ========================================================================
    // AGENT OPERATIONS
    // ========================================================================

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents ORDER BY created_at ASC",
            AGENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_agent).collect()
    }

    pub async fn get_agent(&self, id: &str) -> Result<Agent> {
        let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_agent(row),
            None => Err(StorageError::NotFound(format!("Agent {}", id))),
        }
    }

    /// Create an agent together with its initial runnable version.
    pub async fn create_agent(&self, name: &str, description: Option<&str>) -> Result<Agent> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidInput(
                "Agent name must not be empty".to_string(),
            ));
        }

        let now = Utc::now().to_rfc3339();
        let agent_id = new_id();
        let version_id = new_id();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO agents (id, name, status, description, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(&agent_id)
        .bind(name)
        .bind(AgentStatus::Active.as_str())
        .bind(description)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, &format!("Agent name '{}'", name)))?;

        sqlx::query(
            r#"
            INSERT INTO agent_versions (id, agent_id, code, dependencies, parent_version_id, created_at)
            VALUES (?1, ?2, ?3, ?4, NULL, ?5)
            "#,
        )
        .bind(&version_id)
        .bind(&agent_id)
        .bind(default_agent_code(name))
        .bind(DEFAULT_DEPENDENCIES)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE agents SET current_version_id = ?1 WHERE id = ?2")
            .bind(&version_id)
            .bind(&agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Created agent {} ({})", name, agent_id);
        self.get_agent(&agent_id).await
    }

    /// Delete an agent; versions, runs and secret links cascade.
    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Agent {}", id)));
        }

        info!("Deleted agent {}", id);
        Ok(())
    }

    // ========================================================================
    // VERSION OPERATIONS
    // ========================================================================

    pub async fn get_version(&self, id: &str) -> Result<AgentVersion> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM agent_versions WHERE id = ?1",
            VERSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_version(row),
            None => Err(StorageError::NotFound(format!("Version {}", id))),
        }
    }

    /// The version a new run of this agent would execute.
    pub async fn current_version(&self, agent_id: &str) -> Result<AgentVersion> {
        let agent = self.get_agent(agent_id).await?;
        match agent.current_version_id {
            Some(version_id) => self.get_version(&version_id).await,
            None => Err(StorageError::NotFound(format!(
                "Code for agent {}",
                agent_id
            ))),
        }
    }

    pub async fn list_agent_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agent_versions WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC",
            VERSION_COLUMNS
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_version).collect()
    }

    /// Record new code for an agent. Dependencies carry over from the current version.
    pub async fn update_agent_code(&self, agent_id: &str, code: &str) -> Result<AgentVersion> {
        let agent = self.get_agent(agent_id).await?;

        let dependencies = match &agent.current_version_id {
            Some(current) => self.get_version(current).await?.dependencies,
            None => DEFAULT_DEPENDENCIES.to_string(),
        };

        let now = Utc::now().to_rfc3339();
        let version_id = new_id();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO agent_versions (id, agent_id, code, dependencies, parent_version_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&version_id)
        .bind(agent_id)
        .bind(code)
        .bind(&dependencies)
        .bind(&agent.current_version_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE agents SET current_version_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(&version_id)
            .bind(&now)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Agent {} now at version {}", agent_id, version_id);
        self.get_version(&version_id).await
    }
}

fn row_to_agent(row: SqliteRow) -> Result<Agent> {
    Ok(Agent {
        id: row.get("id"),
        name: row.get("name"),
        status: AgentStatus::from_str(&row.get::<String, _>("status"))?,
        schedule: row.get("schedule"),
        description: row.get("description"),
        current_version_id: row.get("current_version_id"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_version(row: SqliteRow) -> Result<AgentVersion> {
    Ok(AgentVersion {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        code: row.get("code"),
        dependencies: row.get("dependencies"),
        parent_version_id: row.get("parent_version_id"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_store;

    #[tokio::test]
    async fn test_create_agent_creates_runnable_version() {
        let store = setup_test_store().await;

        let agent = store
            .create_agent("scraper", Some("Collects prices"))
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.description.as_deref(), Some("Collects prices"));

        let version = store.current_version(&agent.id).await.unwrap();
        assert!(version.code.contains("Starting agent 'scraper'"));
        assert_eq!(version.dependencies, DEFAULT_DEPENDENCIES);
        assert!(version.parent_version_id.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_agent_name_is_rejected() {
        let store = setup_test_store().await;

        store.create_agent("dup", None).await.unwrap();
        let result = store.create_agent("dup", None).await;

        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_empty_agent_name_is_rejected() {
        let store = setup_test_store().await;
        let result = store.create_agent("   ", None).await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_update_code_links_parent_and_inherits_dependencies() {
        let store = setup_test_store().await;
        let agent = store.create_agent("writer", None).await.unwrap();
        let first = store.current_version(&agent.id).await.unwrap();

        let second = store
            .update_agent_code(&agent.id, "print('v2')")
            .await
            .unwrap();

        assert_eq!(second.code, "print('v2')");
        assert_eq!(second.parent_version_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(second.dependencies, first.dependencies);

        let current = store.current_version(&agent.id).await.unwrap();
        assert_eq!(current.id, second.id);

        let versions = store.list_agent_versions(&agent.id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, second.id);
    }

    #[tokio::test]
    async fn test_delete_agent() {
        let store = setup_test_store().await;
        let agent = store.create_agent("temp", None).await.unwrap();

        store.delete_agent(&agent.id).await.unwrap();

        assert!(matches!(
            store.get_agent(&agent.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_agent(&agent.id).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
