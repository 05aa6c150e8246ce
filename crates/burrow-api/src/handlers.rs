//! API request handlers

use crate::error::ApiError;
use crate::models::*;
use crate::{ApiDoc, ApiState};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_control::generate_id;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::OpenApi;

/// Relay status
#[utoipa::path(
    get,
    path = "/api/status",
    responses(
        (status = 200, description = "Relay status", body = StatusResponse)
    ),
    tag = "system"
)]
pub async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnels: state.registry.tunnel_count(),
        mem: MemoryUsage {
            rss: resident_set_size(),
        },
    })
}

/// Socket counts for one tunnel
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}/status",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel socket counts", body = TunnelStatusResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatusResponse>, ApiError> {
    let session = state.registry.lookup(&id).ok_or(ApiError::NotFound)?;
    let stats = session.stats();
    Ok(Json(TunnelStatusResponse {
        connected_sockets: stats.connected_sockets,
        idle_sockets: stats.idle_sockets,
        leased_sockets: stats.leased_sockets,
        created_at: session.created_at(),
    }))
}

/// Create a tunnel with the requested identifier
#[utoipa::path(
    get,
    path = "/{id}",
    params(
        ("id" = String, Path, description = "Requested tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel created", body = CreateTunnelResponse),
        (status = 403, description = "Identifier rejected", body = ErrorResponse),
        (status = 429, description = "Too many tunnels from this address", body = ErrorResponse),
        (status = 500, description = "Tunnel listener could not be started", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn create_tunnel(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    create(&state, peer, &headers, &id, None).await
}

/// Create a tunnel protected by a secret
///
/// Presenting the same secret again replaces the existing tunnel of that identifier.
#[utoipa::path(
    get,
    path = "/{id}/{secret}",
    params(
        ("id" = String, Path, description = "Requested tunnel ID"),
        ("secret" = String, Path, description = "Secret that owns the identifier")
    ),
    responses(
        (status = 200, description = "Tunnel created", body = CreateTunnelResponse),
        (status = 403, description = "Identifier rejected", body = ErrorResponse),
        (status = 429, description = "Too many tunnels from this address", body = ErrorResponse),
        (status = 500, description = "Tunnel listener could not be started", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn create_tunnel_with_secret(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((id, secret)): Path<(String, String)>,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    create(&state, peer, &headers, &id, Some(&secret)).await
}

/// Landing page redirect, or a tunnel with a random identifier for `/?new`
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Tunnel created (`?new`)", body = CreateTunnelResponse),
        (status = 302, description = "Redirect to the landing page")
    ),
    tag = "tunnels"
)]
pub async fn landing(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    if query.contains_key("new") {
        let id = generate_id();
        return Ok(create(&state, peer, &headers, &id, None)
            .await?
            .into_response());
    }
    Ok((StatusCode::FOUND, [(header::LOCATION, state.landing_page.clone())]).into_response())
}

/// OpenAPI document
pub async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn create(
    state: &ApiState,
    peer: SocketAddr,
    headers: &HeaderMap,
    id: &str,
    secret: Option<&str>,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    state.policy.validate(id)?;

    debug!("Tunnel '{}' requested by {}", id, peer);
    let created = state
        .registry
        .create(id, secret, Some(peer.ip()))
        .await?;

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let url = format!("{}://{}.{}", state.schema(), created.id, host);
    info!("Tunnel '{}' available at {}", created.id, url);

    Ok(Json(CreateTunnelResponse {
        id: created.id,
        port: created.port,
        max_conn_count: created.max_conn_count,
        url,
    }))
}

/// Resident set size of this process, read from procfs
fn resident_set_size() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
