//! API request/response models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A newly created tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTunnelResponse {
    /// Tunnel identifier (the subdomain label)
    pub id: String,
    /// Port the agent dials to open reverse connections
    pub port: u16,
    /// Maximum number of reverse connections the relay keeps idle
    pub max_conn_count: usize,
    /// Public URL of the tunnel
    pub url: String,
}

/// Process memory usage
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MemoryUsage {
    /// Resident set size in bytes, when the platform reports it
    pub rss: Option<u64>,
}

/// Relay status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    /// Number of live tunnels
    pub tunnels: usize,
    pub mem: MemoryUsage,
}

/// Per-tunnel socket counts
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelStatusResponse {
    /// Idle plus leased reverse connections
    pub connected_sockets: usize,
    pub idle_sockets: usize,
    pub leased_sockets: usize,
    /// When the tunnel was created
    pub created_at: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
