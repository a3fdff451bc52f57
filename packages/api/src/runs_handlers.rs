// ABOUTME: HTTP handlers for triggering runs, inspecting them and streaming their logs
// ABOUTME: Streams are SSE with one data message per log line and a final complete event

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::info;

use crate::error::{ApiResult, AppError};
use crate::response::{created, ok};
use crate::sse::{create_sse_response, run_event, GuardedSseStream};
use crate::AppState;

/// Seconds a client is told to wait after hitting the stream limit
const STREAM_RETRY_AFTER_SECS: u64 = 5;

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub agent_id: Option<String>,
}

/// GET /api/runs?agent_id= - Runs of an agent, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Response> {
    let agent_id = query
        .agent_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::validation("agent_id query parameter is required"))?;

    state.store().get_agent(&agent_id).await?;
    Ok(ok(state.store().list_runs(&agent_id).await?))
}

/// POST /api/runs/trigger/{agent_id} - Start a run of the agent's current code.
pub async fn trigger_run(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Response> {
    let run = state.manager.trigger(&agent_id).await?;
    info!(run_id = %run.id, "Triggered run for agent {}", agent_id);
    Ok(created(run))
}

/// GET /api/runs/{id} - Stored run record.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    Ok(ok(state.store().get_run(&run_id).await?))
}

/// GET /api/runs/{id}/stream - Live or replayed log stream (SSE).
pub async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    let ip = client_ip(&request);
    let guard = state
        .sse
        .try_acquire(ip)
        .map_err(|_| AppError::RateLimitExceeded {
            retry_after: STREAM_RETRY_AFTER_SECS,
        })?;

    let events = state.manager.stream(&run_id).await?;
    info!(run_id = %run_id, ip = %ip, "Viewer attached to run stream");

    let stream = events.map(|event| Ok::<_, Infallible>(run_event(event)));
    Ok(create_sse_response(GuardedSseStream::new(stream, guard)).into_response())
}

/// GET /api/runs/{id}/artifacts - Names of files the run saved.
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    Ok(ok(state.manager.list_artifacts(&run_id).await?))
}

/// GET /api/runs/{id}/artifacts/{name} - Download one artifact.
pub async fn download_artifact(
    State(state): State<AppState>,
    Path((run_id, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let content = state.manager.read_artifact(&run_id, &name).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        name.replace(['"', '\\', '/'], "_")
    );

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        content,
    )
        .into_response())
}

/// Peer address when served with connect info, loopback otherwise (e.g. in-process tests).
fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
