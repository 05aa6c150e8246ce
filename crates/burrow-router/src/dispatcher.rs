//! HTTP host-based dispatch

use burrow_control::{Session, SessionRegistry};
use burrow_proto::normalize_host;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Dispatch errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Host header is required")]
    MissingHost,

    /// The host carries no tunnel label; the request is for the relay itself
    #[error("Host has no tunnel subdomain")]
    NoSubdomain,

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),
}

/// Routes requests to sessions by the subdomain label of their `Host` header
#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    domain: Option<String>,
}

impl Dispatcher {
    /// `domain` is the base domain tunnels live under (e.g. `example.com`). Without one, the
    /// subdomain is everything left of the host's registrable domain (public suffix plus one
    /// label), so `foo.example.co.uk` routes to `foo`.
    pub fn new(registry: SessionRegistry, domain: Option<String>) -> Self {
        let domain = domain
            .map(|d| normalize_host(&d))
            .filter(|d| !d.is_empty());
        Self { registry, domain }
    }

    /// Tunnel label of a `Host` header value, if it has one
    pub fn subdomain(&self, host: &str) -> Option<String> {
        let host = normalize_host(host);
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let base = match &self.domain {
            Some(domain) => domain.as_str(),
            None => psl::domain_str(&host)?,
        };
        let label = host.strip_suffix(base)?.strip_suffix('.')?;

        (!label.is_empty()).then(|| label.to_string())
    }

    /// Resolve the session a request is addressed to
    pub fn resolve(&self, host: Option<&str>) -> Result<Arc<Session>, RouteError> {
        let host = host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(RouteError::MissingHost)?;

        let Some(label) = self.subdomain(host) else {
            trace!("Host {} has no tunnel subdomain", host);
            return Err(RouteError::NoSubdomain);
        };

        match self.registry.lookup(&label) {
            Some(session) => {
                trace!("Routed {} to tunnel '{}'", host, label);
                Ok(session)
            }
            None => {
                debug!("No tunnel registered for {}", host);
                Err(RouteError::UnknownTunnel(label))
            }
        }
    }
}
