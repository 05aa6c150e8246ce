//! Tunnel session: owns one connection pool and proxies public traffic through it

use crate::relay::{relay_request, splice, Exchange, ProxyError};
use burrow_pool::{ConnectionPool, PoolConfig, PoolError};
use burrow_proto::{simple_response, RequestHead};
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Socket counts reported by the status endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Idle plus leased reverse sockets
    pub connected_sockets: usize,
    pub idle_sockets: usize,
    pub leased_sockets: usize,
}

/// What the public connection should do after a proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The exchange completed cleanly; read the next request from the same connection
    KeepAlive,
    /// The connection has been consumed and must be closed
    Closed,
}

/// A live tunnel
pub struct Session {
    id: String,
    secret: Option<String>,
    source: Option<IpAddr>,
    created_at: DateTime<Utc>,
    pool: ConnectionPool,
    acquire_timeout: Duration,
    closed: AtomicBool,
    counted: AtomicBool,
    terminated: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: String,
        secret: Option<String>,
        source: Option<IpAddr>,
        pool_config: PoolConfig,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(id.clone(), pool_config);
        Arc::new(Self {
            id,
            secret,
            source,
            created_at: Utc::now(),
            pool,
            acquire_timeout,
            closed: AtomicBool::new(false),
            counted: AtomicBool::new(false),
            terminated: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub(crate) fn secret_matches(&self, secret: &str) -> bool {
        self.secret.as_deref() == Some(secret)
    }

    /// Port the agent dials for reverse connections (set once started)
    pub fn port(&self) -> Option<u16> {
        self.pool.port()
    }

    /// Maximum idle reverse sockets the session retains
    pub fn max_conn_count(&self) -> usize {
        self.pool.capacity()
    }

    /// Start the pool listener and the offline watchdog.
    ///
    /// Once started, the session closes itself whenever no reverse socket has been connected
    /// for `offline_grace`.
    pub(crate) async fn start(self: &Arc<Self>, offline_grace: Duration) -> Result<u16, PoolError> {
        let port = self.pool.start().await?;
        tokio::spawn(offline_monitor(
            Arc::downgrade(self),
            self.pool.subscribe_connected(),
            offline_grace,
            self.terminated.clone(),
        ));
        Ok(port)
    }

    pub fn stats(&self) -> SessionStats {
        let stats = self.pool.stats();
        SessionStats {
            connected_sockets: stats.connected,
            idle_sockets: stats.idle,
            leased_sockets: stats.leased,
        }
    }

    /// Shut the pool down and signal termination. Returns false if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.pool.shutdown();
        self.terminated.cancel();
        info!("Tunnel '{}' closed", self.id);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been closed, whichever side closed it
    pub async fn closed(&self) {
        self.terminated.cancelled().await
    }

    pub(crate) fn mark_counted(&self) {
        self.counted.store(true, Ordering::SeqCst);
    }

    /// Claim the session's slot in the tunnel counter; true at most once
    pub(crate) fn take_counted(&self) -> bool {
        self.counted.swap(false, Ordering::SeqCst)
    }

    /// Proxy one HTTP request whose head (and any bytes after it) is in `buffered`.
    ///
    /// Writes `504 Gateway Timeout` to the client when no reverse socket turns up in time.
    pub async fn handle_request<S>(
        &self,
        inbound: &mut S,
        head: &RequestHead,
        buffered: &[u8],
    ) -> Result<RequestOutcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut socket = match self.pool.acquire(self.acquire_timeout).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("No reverse connection for '{}': {}", self.id, e);
                let response = match e {
                    PoolError::NoAvailableConnection { .. } => {
                        simple_response(StatusCode::GATEWAY_TIMEOUT, "Tunnel timeout\n")
                    }
                    _ => simple_response(StatusCode::BAD_GATEWAY, "Tunnel unavailable\n"),
                };
                let _ = inbound.write_all(&response).await;
                return Err(e.into());
            }
        };

        debug!(
            "Proxying {} {} for '{}' via {}",
            head.method,
            head.path,
            self.id,
            socket.peer_addr()
        );

        match relay_request(inbound, &mut socket, head, buffered, &self.id).await? {
            Exchange::Reusable => {
                if socket.release() {
                    trace!("Reverse connection returned to '{}' pool", self.id);
                }
                Ok(RequestOutcome::KeepAlive)
            }
            Exchange::Finished => Ok(RequestOutcome::Closed),
        }
    }

    /// Relay an upgrade request and everything after it, for the lifetime of the connection.
    ///
    /// On acquisition failure nothing is written; the caller drops the connection.
    pub async fn handle_upgrade<S>(&self, inbound: &mut S, buffered: &[u8]) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut socket = self.pool.acquire(self.acquire_timeout).await?;
        debug!(
            "Upgrading connection for '{}' via {}",
            self.id,
            socket.peer_addr()
        );
        socket.write_all(buffered).await?;
        splice(inbound, &mut socket, &self.id).await;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminated.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("port", &self.port())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Close the session once it has had no reverse socket for `grace`
async fn offline_monitor(
    session: Weak<Session>,
    mut connected: watch::Receiver<usize>,
    grace: Duration,
    terminated: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = terminated.cancelled() => return,
            offline = connected.wait_for(|n| *n == 0) => {
                if offline.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            _ = terminated.cancelled() => return,
            online = connected.wait_for(|n| *n > 0) => {
                if online.is_err() {
                    return;
                }
                continue;
            }
            _ = tokio::time::sleep(grace) => {}
        }

        let Some(session) = session.upgrade() else {
            return;
        };
        info!(
            "Tunnel '{}' has had no reverse connection for {:?}",
            session.id, grace
        );
        session.close();
        return;
    }
}
