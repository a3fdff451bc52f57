// ABOUTME: Run record persistence and the RunStore seam used by the execution engine
// ABOUTME: Commits rewrite the whole record and are refused once a run is terminal

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use crate::models::{RunRecord, RunStatus};
use crate::{
    new_id, parse_optional_timestamp, parse_timestamp, Result, SqliteStore, StorageError,
};

/// Durable run storage as seen by the execution engine.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch a run; `StorageError::NotFound` if absent.
    async fn get_run(&self, id: &str) -> Result<RunRecord>;

    /// Rewrite every mutable field of the record.
    /// Fails with `StorageError::TerminalRun` if the stored record is already terminal.
    async fn commit_run(&self, run: &RunRecord) -> Result<()>;

    /// Runs whose stored status is `queued` or `running`.
    async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>>;
}

const RUN_COLUMNS: &str = "id, agent_id, version_id, status, trigger_type, input_payload, start_time, end_time, logs, artifacts_written, created_at";

impl SqliteStore {
    // ========================================================================
    // RUN OPERATIONS
    // ========================================================================

    /// Create a queued run pinned to the agent's current version.
    pub async fn create_run(
        &self,
        agent_id: &str,
        trigger_type: &str,
        input_payload: Option<JsonValue>,
    ) -> Result<RunRecord> {
        let version = self.current_version(agent_id).await?;

        let run = RunRecord {
            id: new_id(),
            agent_id: agent_id.to_string(),
            version_id: version.id,
            status: RunStatus::Queued,
            trigger_type: trigger_type.to_string(),
            input_payload,
            start_time: None,
            end_time: None,
            logs: String::new(),
            artifacts_written: Vec::new(),
            created_at: Utc::now(),
        };

        let payload_json = run
            .input_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let artifacts_json = serde_json::to_string(&run.artifacts_written)?;

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, agent_id, version_id, status, trigger_type, input_payload,
                start_time, end_time, logs, artifacts_written, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8, ?9)
            "#,
        )
        .bind(&run.id)
        .bind(&run.agent_id)
        .bind(&run.version_id)
        .bind(run.status.as_str())
        .bind(&run.trigger_type)
        .bind(payload_json)
        .bind(&run.logs)
        .bind(artifacts_json)
        .bind(run.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!(
            "Created run {} for agent {} at version {}",
            run.id, run.agent_id, run.version_id
        );
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> Result<RunRecord> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_run(row),
            None => Err(StorageError::NotFound(format!("Run {}", id))),
        }
    }

    /// Runs of one agent, newest first.
    pub async fn list_runs(&self, agent_id: &str) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC",
            RUN_COLUMNS
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_run).collect()
    }

    /// Stored transcript of the agent's most recent run, if it ever ran.
    pub async fn latest_run_logs(&self, agent_id: &str) -> Result<Option<String>> {
        let logs = sqlx::query_scalar::<_, String>(
            "SELECT logs FROM runs WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(logs)
    }

    pub async fn commit_run(&self, run: &RunRecord) -> Result<()> {
        let artifacts_json = serde_json::to_string(&run.artifacts_written)?;
        let payload_json = run
            .input_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?1, start_time = ?2, end_time = ?3, logs = ?4,
                artifacts_written = ?5, input_payload = ?6
            WHERE id = ?7 AND status IN ('queued', 'running')
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.start_time.map(|d| d.to_rfc3339()))
        .bind(run.end_time.map(|d| d.to_rfc3339()))
        .bind(&run.logs)
        .bind(artifacts_json)
        .bind(payload_json)
        .bind(&run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM runs WHERE id = ?1")
                .bind(&run.id)
                .fetch_one(&self.pool)
                .await?;

            return Err(if exists > 0 {
                StorageError::TerminalRun(run.id.clone())
            } else {
                StorageError::NotFound(format!("Run {}", run.id))
            });
        }

        debug!(
            "Committed run {} (status: {}, {} bytes of logs)",
            run.id,
            run.status.as_str(),
            run.logs.len()
        );
        Ok(())
    }

    pub async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE status IN ('queued', 'running') ORDER BY created_at ASC",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_run).collect()
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn get_run(&self, id: &str) -> Result<RunRecord> {
        SqliteStore::get_run(self, id).await
    }

    async fn commit_run(&self, run: &RunRecord) -> Result<()> {
        SqliteStore::commit_run(self, run).await
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>> {
        SqliteStore::list_unfinished_runs(self).await
    }
}

fn row_to_run(row: SqliteRow) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        version_id: row.get("version_id"),
        status: RunStatus::from_str(&row.get::<String, _>("status"))?,
        trigger_type: row.get("trigger_type"),
        input_payload: row
            .get::<Option<String>, _>("input_payload")
            .and_then(|s| serde_json::from_str(&s).ok()),
        start_time: parse_optional_timestamp(row.get("start_time"))?,
        end_time: parse_optional_timestamp(row.get("end_time"))?,
        logs: row.get("logs"),
        artifacts_written: serde_json::from_str(&row.get::<String, _>("artifacts_written"))?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}
