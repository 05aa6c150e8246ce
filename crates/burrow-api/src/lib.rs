//! HTTP API of the relay: tunnel creation, status endpoints and the landing redirect
//!
//! The router is served for requests whose `Host` carries no tunnel subdomain. Handlers
//! expect a [`ConnectInfo<SocketAddr>`](axum::extract::ConnectInfo) request extension
//! holding the client address, which is what per-source quotas are charged to.

pub mod error;
pub mod handlers;
pub mod models;

use axum::{routing::get, Router};
use burrow_control::{SessionRegistry, SubdomainPolicy};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use error::ApiError;

/// Application state shared across handlers
pub struct ApiState {
    pub registry: SessionRegistry,
    pub policy: SubdomainPolicy,
    /// Advertise `https` tunnel URLs
    pub secure: bool,
    /// Where `GET /` redirects to
    pub landing_page: String,
}

impl ApiState {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            policy: SubdomainPolicy::new(),
            secure: false,
            landing_page: DEFAULT_LANDING_PAGE.to_string(),
        }
    }

    pub fn schema(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

pub const DEFAULT_LANDING_PAGE: &str = "https://github.com/burrow-tunnel/burrow";

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Burrow Relay API",
        version = "0.1.0",
        description = "Create reverse tunnels and inspect their status"
    ),
    paths(
        handlers::status,
        handlers::tunnel_status,
        handlers::create_tunnel,
        handlers::create_tunnel_with_secret,
        handlers::landing,
    ),
    components(
        schemas(
            models::CreateTunnelResponse,
            models::MemoryUsage,
            models::StatusResponse,
            models::TunnelStatusResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "tunnels", description = "Tunnel creation and status endpoints"),
        (name = "system", description = "Relay status endpoints")
    )
)]
pub struct ApiDoc;

/// Build the API router
pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/openapi.json", get(handlers::openapi))
        .route("/api/tunnels/{id}/status", get(handlers::tunnel_status))
        .route("/", get(handlers::landing))
        .route("/{id}", get(handlers::create_tunnel))
        .route("/{id}/{secret}", get(handlers::create_tunnel_with_secret))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
