//! Burrow relay library
//!
//! Exposes a ready-to-run [`Relay`] and re-exports the building blocks it is made of, for
//! applications that want to embed a reverse-tunnel relay or assemble their own.
//!
//! # Quick Start
//!
//! ```ignore
//! use burrow_lib::{Relay, RelayConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig {
//!         domain: Some("tunnel.example.com".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let relay = Relay::bind(config).await?;
//!     println!("Relay listening on {}", relay.local_addr()?);
//!
//!     relay.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **`burrow-proto`**: HTTP/1.x head parsing and message framing
//! - **`burrow-pool`**: per-tunnel reverse connection pool
//! - **`burrow-control`**: session registry and the proxy adapter
//! - **`burrow-router`**: `Host` header to session dispatch
//! - **`burrow-api`**: tunnel creation and status endpoints
//! - **`burrow-server-http`**: public HTTP listener

pub mod relay;

pub use relay::{Relay, RelayConfig, RelayError};

pub use burrow_api::{build_router, ApiDoc, ApiError, ApiState, DEFAULT_LANDING_PAGE};
pub use burrow_control::{
    generate_id, CreatedSession, ProxyError, RegistryConfig, RegistryError, RequestOutcome,
    Session, SessionRegistry, SessionStats, SubdomainError, SubdomainPolicy,
};
pub use burrow_pool::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledSocket};
pub use burrow_router::{Dispatcher, RouteError};
pub use burrow_server_http::{HttpServer, HttpServerConfig, HttpServerError};
