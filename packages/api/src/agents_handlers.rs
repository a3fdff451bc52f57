// ABOUTME: HTTP request handlers for agents, their code versions and linked secrets
// ABOUTME: Thin wrappers over the SQLite store; runs are handled in runs_handlers

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{ApiResult, AppError};
use crate::response::{created, ok};
use crate::secrets_handlers::{summarize, SecretSummary};
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateCodeRequest {
    pub code: String,
}

/// GET /api/agents - List all agents.
pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(ok(state.store().list_agents().await?))
}

/// POST /api/agents - Create an agent with a runnable starter version.
pub async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> ApiResult<Response> {
    info!("Creating agent {}", request.name);
    let agent = state
        .store()
        .create_agent(&request.name, request.description.as_deref())
        .await?;
    Ok(created(agent))
}

/// GET /api/agents/{id} - Get a single agent.
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    Ok(ok(state.store().get_agent(&agent_id).await?))
}

/// DELETE /api/agents/{id} - Delete an agent with its versions, runs and links.
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    info!("Deleting agent {}", agent_id);
    state.store().delete_agent(&agent_id).await?;
    Ok(ok(json!({ "deleted": true })))
}

/// GET /api/agents/{id}/code - Current code version.
pub async fn get_agent_code(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    Ok(ok(state.store().current_version(&agent_id).await?))
}

/// POST /api/agents/{id}/code - Save code as a new version.
pub async fn update_agent_code(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<UpdateCodeRequest>,
) -> ApiResult<Response> {
    if request.code.trim().is_empty() {
        return Err(AppError::validation("Code must not be empty"));
    }
    let version = state
        .store()
        .update_agent_code(&agent_id, &request.code)
        .await?;
    info!("Agent {} now at version {}", agent_id, version.id);
    Ok(created(version))
}

/// GET /api/agents/{id}/versions - Code history, newest first.
pub async fn list_agent_versions(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    state.store().get_agent(&agent_id).await?;
    Ok(ok(state.store().list_agent_versions(&agent_id).await?))
}

/// GET /api/agents/{id}/logs - Stored logs of the latest run.
pub async fn get_agent_logs(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    state.store().get_agent(&agent_id).await?;
    let logs = state
        .store()
        .latest_run_logs(&agent_id)
        .await?
        .unwrap_or_default();
    Ok(ok(json!({ "logs": logs })))
}

/// GET /api/agents/{id}/secrets - Secrets injected into this agent's runs.
pub async fn list_agent_secrets(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    state.store().get_agent(&agent_id).await?;
    let secrets: Vec<SecretSummary> = state
        .store()
        .linked_secrets(&agent_id)
        .await?
        .into_iter()
        .map(|secret| summarize(secret, state.cipher.as_ref()))
        .collect();
    Ok(ok(secrets))
}

/// POST /api/agents/{id}/secrets/{secret_id} - Link a secret.
pub async fn link_secret(
    State(state): State<AppState>,
    Path((agent_id, secret_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    state.store().link_secret(&agent_id, &secret_id).await?;
    Ok(ok(json!({ "linked": true })))
}

/// DELETE /api/agents/{id}/secrets/{secret_id} - Unlink a secret.
pub async fn unlink_secret(
    State(state): State<AppState>,
    Path((agent_id, secret_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    state.store().unlink_secret(&agent_id, &secret_id).await?;
    Ok(ok(json!({ "linked": false })))
}
