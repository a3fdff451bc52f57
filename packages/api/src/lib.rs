// ABOUTME: HTTP API layer for Kernel providing REST endpoints and routing
// ABOUTME: Agents, secrets, runs with SSE log streams, and run artifacts

use axum::{
    extract::State,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use kernel_runtime::RunManager;
use kernel_security::SecretCipher;
use kernel_storage::SqliteStore;
use serde_json::json;

pub mod agents_handlers;
pub mod error;
pub mod response;
pub mod runs_handlers;
pub mod secrets_handlers;
pub mod sse;

pub use error::{ApiResult, AppError};
pub use sse::SseConnectionTracker;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: RunManager,
    pub cipher: Option<SecretCipher>,
    pub sse: SseConnectionTracker,
}

impl AppState {
    pub fn new(
        manager: RunManager,
        cipher: Option<SecretCipher>,
        sse_max_connections_per_ip: usize,
    ) -> Self {
        Self {
            manager,
            cipher,
            sse: SseConnectionTracker::new(sse_max_connections_per_ip),
        }
    }

    pub fn store(&self) -> &SqliteStore {
        self.manager.store()
    }
}

/// Creates the agents API router (nested under /api/agents)
pub fn create_agents_router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(agents_handlers::list_agents).post(agents_handlers::create_agent),
        )
        .route(
            "/{id}",
            get(agents_handlers::get_agent).delete(agents_handlers::delete_agent),
        )
        .route(
            "/{id}/code",
            get(agents_handlers::get_agent_code).post(agents_handlers::update_agent_code),
        )
        .route("/{id}/versions", get(agents_handlers::list_agent_versions))
        .route("/{id}/logs", get(agents_handlers::get_agent_logs))
        .route("/{id}/secrets", get(agents_handlers::list_agent_secrets))
        .route(
            "/{id}/secrets/{secret_id}",
            post(agents_handlers::link_secret).delete(agents_handlers::unlink_secret),
        )
}

/// Creates the secrets API router (nested under /api/secrets)
pub fn create_secrets_router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(secrets_handlers::list_secrets).post(secrets_handlers::create_secret),
        )
        .route("/{id}", delete(secrets_handlers::delete_secret))
}

/// Creates the runs API router (nested under /api/runs)
pub fn create_runs_router() -> Router<AppState> {
    Router::new()
        .route("/", get(runs_handlers::list_runs))
        .route("/trigger/{agent_id}", post(runs_handlers::trigger_run))
        .route("/{id}", get(runs_handlers::get_run))
        .route("/{id}/stream", get(runs_handlers::stream_run))
        .route("/{id}/artifacts", get(runs_handlers::list_artifacts))
        .route(
            "/{id}/artifacts/{name}",
            get(runs_handlers::download_artifact),
        )
}

/// GET /api/health - Service status.
pub async fn health_check(State(state): State<AppState>) -> Response {
    response::ok(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "kernel",
        "active_runs": state.manager.active_runs().await.len(),
    }))
}

/// Full application router with every API route under /api
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .nest("/agents", create_agents_router())
        .nest("/secrets", create_secrets_router())
        .nest("/runs", create_runs_router());

    Router::new().nest("/api", api).with_state(state)
}
