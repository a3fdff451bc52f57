// ABOUTME: Secret records and agent-to-secret links
// ABOUTME: Values are stored exactly as given; encryption happens before they reach this layer

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;

use crate::models::Secret;
use crate::{map_unique_violation, new_id, parse_timestamp, Result, SqliteStore, StorageError};

const SECRET_COLUMNS: &str =
    "s.id AS id, s.key AS key, s.value AS value, s.description AS description, s.created_at AS created_at";

impl SqliteStore {
    // ========================================================================
    // SECRET OPERATIONS
    // ========================================================================

    pub async fn list_secrets(&self) -> Result<Vec<Secret>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM secrets s ORDER BY s.key ASC",
            SECRET_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_secret).collect()
    }

    pub async fn get_secret(&self, id: &str) -> Result<Secret> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM secrets s WHERE s.id = ?1",
            SECRET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_secret(row),
            None => Err(StorageError::NotFound(format!("Secret {}", id))),
        }
    }

    /// Store a secret. `encrypted_value` must already be ciphertext.
    pub async fn create_secret(
        &self,
        key: &str,
        encrypted_value: &str,
        description: Option<&str>,
    ) -> Result<Secret> {
        let key = key.trim();
        if key.is_empty() {
            return Err(StorageError::InvalidInput(
                "Secret key must not be empty".to_string(),
            ));
        }

        let id = new_id();
        sqlx::query(
            r#"
            INSERT INTO secrets (id, key, value, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&id)
        .bind(key)
        .bind(encrypted_value)
        .bind(description)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("Secret key '{}'", key)))?;

        info!("Created secret {} ({})", key, id);
        self.get_secret(&id).await
    }

    pub async fn delete_secret(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Secret {}", id)));
        }
        Ok(())
    }

    // ========================================================================
    // LINK OPERATIONS
    // ========================================================================

    /// Link a secret to an agent. Linking twice is a no-op.
    pub async fn link_secret(&self, agent_id: &str, secret_id: &str) -> Result<()> {
        self.get_agent(agent_id).await?;
        self.get_secret(secret_id).await?;

        sqlx::query(
            "INSERT OR IGNORE INTO agent_secrets (agent_id, secret_id, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(agent_id)
        .bind(secret_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a link. Unlinking something never linked is a no-op.
    pub async fn unlink_secret(&self, agent_id: &str, secret_id: &str) -> Result<()> {
        self.get_agent(agent_id).await?;
        self.get_secret(secret_id).await?;

        sqlx::query("DELETE FROM agent_secrets WHERE agent_id = ?1 AND secret_id = ?2")
            .bind(agent_id)
            .bind(secret_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn linked_secrets(&self, agent_id: &str) -> Result<Vec<Secret>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM secrets s
            JOIN agent_secrets l ON l.secret_id = s.id
            WHERE l.agent_id = ?1
            ORDER BY s.key ASC
            "#,
            SECRET_COLUMNS
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_secret).collect()
    }
}

fn row_to_secret(row: SqliteRow) -> Result<Secret> {
    Ok(Secret {
        id: row.get("id"),
        key: row.get("key"),
        value: row.get("value"),
        description: row.get("description"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_store;

    #[tokio::test]
    async fn test_secret_crud() {
        let store = setup_test_store().await;

        let secret = store
            .create_secret("API_TOKEN", "ciphertext", Some("upstream token"))
            .await
            .unwrap();
        assert_eq!(secret.key, "API_TOKEN");

        let listed = store.list_secrets().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, "ciphertext");

        let duplicate = store.create_secret("API_TOKEN", "other", None).await;
        assert!(matches!(duplicate, Err(StorageError::Duplicate(_))));

        store.delete_secret(&secret.id).await.unwrap();
        assert!(store.list_secrets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_and_unlink_are_idempotent() {
        let store = setup_test_store().await;
        let agent = store.create_agent("linked", None).await.unwrap();
        let secret = store.create_secret("DB_PASS", "x", None).await.unwrap();

        store.link_secret(&agent.id, &secret.id).await.unwrap();
        store.link_secret(&agent.id, &secret.id).await.unwrap();
        assert_eq!(store.linked_secrets(&agent.id).await.unwrap().len(), 1);

        store.unlink_secret(&agent.id, &secret.id).await.unwrap();
        store.unlink_secret(&agent.id, &secret.id).await.unwrap();
        assert!(store.linked_secrets(&agent.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_requires_existing_agent_and_secret() {
        let store = setup_test_store().await;
        let agent = store.create_agent("lonely", None).await.unwrap();

        let result = store.link_secret(&agent.id, "nope").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));

        let secret = store.create_secret("K", "v", None).await.unwrap();
        let result = store.link_secret("nope", &secret.id).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_deleting_secret_drops_links() {
        let store = setup_test_store().await;
        let agent = store.create_agent("cascade", None).await.unwrap();
        let secret = store.create_secret("GONE", "v", None).await.unwrap();
        store.link_secret(&agent.id, &secret.id).await.unwrap();

        store.delete_secret(&secret.id).await.unwrap();

        assert!(store.linked_secrets(&agent.id).await.unwrap().is_empty());
    }
}
