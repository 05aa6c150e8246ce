//! Ready-to-run relay: registry, dispatcher, API and public listener wired together

use burrow_api::{build_router, ApiState, DEFAULT_LANDING_PAGE};
use burrow_control::{RegistryConfig, SessionRegistry, SubdomainPolicy};
use burrow_router::Dispatcher;
use burrow_server_http::{HttpServer, HttpServerConfig, HttpServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Server(#[from] HttpServerError),
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub http: HttpServerConfig,
    pub registry: RegistryConfig,
    /// Base domain tunnels are served under; derived from the `Host` header when unset
    pub domain: Option<String>,
    /// Advertise `https` tunnel URLs
    pub secure: bool,
    pub landing_page: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http: HttpServerConfig::default(),
            registry: RegistryConfig::default(),
            domain: None,
            secure: false,
            landing_page: DEFAULT_LANDING_PAGE.to_string(),
        }
    }
}

/// A bound relay, ready to [`run`](Relay::run)
pub struct Relay {
    server: HttpServer,
    registry: SessionRegistry,
}

impl Relay {
    /// Build the relay and bind its public listener
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let registry = SessionRegistry::new(config.registry);
        let dispatcher = Dispatcher::new(registry.clone(), config.domain);

        let api_state = Arc::new(ApiState {
            registry: registry.clone(),
            policy: SubdomainPolicy::new(),
            secure: config.secure,
            landing_page: config.landing_page,
        });
        let api = build_router(api_state);

        let server = HttpServer::bind(config.http, dispatcher, api).await?;
        Ok(Self { server, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.server.local_addr()?)
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Serve until `shutdown` is cancelled, then close every tunnel
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let result = self.server.run(shutdown).await;
        info!("Shutting down relay");
        self.registry.shutdown();
        result.map_err(RelayError::from)
    }
}
