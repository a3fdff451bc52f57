// ABOUTME: HTTP handlers for secret management
// ABOUTME: Values are encrypted before storage and only ever returned as a short hint

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use kernel_security::{secret_hint, SecretCipher};
use kernel_storage::Secret;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiResult, AppError};
use crate::response::{created, ok};
use crate::AppState;

/// Secret as shown to clients. The value never leaves the server.
#[derive(Debug, Serialize)]
pub struct SecretSummary {
    pub id: String,
    pub key: String,
    pub description: Option<String>,
    /// Last characters of the decrypted value, when it can be decrypted
    pub hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn summarize(secret: Secret, cipher: Option<&SecretCipher>) -> SecretSummary {
    let hint = cipher.and_then(|cipher| match cipher.decrypt(&secret.value) {
        Ok(plaintext) => Some(secret_hint(&plaintext)),
        Err(e) => {
            warn!("Cannot decrypt secret {}: {}", secret.key, e);
            None
        }
    });

    SecretSummary {
        id: secret.id,
        key: secret.key,
        description: secret.description,
        hint,
        created_at: secret.created_at,
    }
}

#[derive(Deserialize)]
pub struct CreateSecretRequest {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
}

/// GET /api/secrets - List secrets without their values.
pub async fn list_secrets(State(state): State<AppState>) -> ApiResult<Response> {
    let secrets = state.store().list_secrets().await?;
    let summaries: Vec<SecretSummary> = secrets
        .into_iter()
        .map(|secret| summarize(secret, state.cipher.as_ref()))
        .collect();
    Ok(ok(summaries))
}

/// POST /api/secrets - Encrypt and store a secret.
pub async fn create_secret(
    State(state): State<AppState>,
    Json(request): Json<CreateSecretRequest>,
) -> ApiResult<Response> {
    let cipher = state
        .cipher
        .as_ref()
        .ok_or_else(|| AppError::config("KERNEL_SECRET_KEY is not set"))?;

    if request.value.is_empty() {
        return Err(AppError::validation("Secret value must not be empty"));
    }

    info!("Creating secret {}", request.key);
    let encrypted = cipher.encrypt(&request.value)?;
    let secret = state
        .store()
        .create_secret(&request.key, &encrypted, request.description.as_deref())
        .await?;

    Ok(created(summarize(secret, Some(cipher))))
}

/// DELETE /api/secrets/{id} - Delete a secret and its agent links.
pub async fn delete_secret(
    State(state): State<AppState>,
    Path(secret_id): Path<String>,
) -> ApiResult<Response> {
    info!("Deleting secret {}", secret_id);
    state.store().delete_secret(&secret_id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })))
}
