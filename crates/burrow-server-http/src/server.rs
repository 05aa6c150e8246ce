//! HTTP server implementation

use crate::prefixed::PrefixedIo;
use axum::extract::ConnectInfo;
use axum::Router;
use burrow_control::RequestOutcome;
use burrow_proto::{simple_response, HttpParseError, RequestHead};
use burrow_router::{Dispatcher, RouteError};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, trace, warn};

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Bad request: {0}")]
    BadRequest(#[from] HttpParseError),

    #[error("Timed out waiting for a request")]
    HeadTimeout,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// How long a connection may take to deliver a request head (also bounds idle keep-alive)
    pub head_timeout: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            head_timeout: Duration::from_secs(60),
        }
    }
}

/// Public HTTP server
pub struct HttpServer {
    config: HttpServerConfig,
    listener: TcpListener,
    dispatcher: Dispatcher,
    api: Router,
}

impl HttpServer {
    /// Bind the public listener
    pub async fn bind(
        config: HttpServerConfig,
        dispatcher: Dispatcher,
        api: Router,
    ) -> Result<Self, HttpServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            config,
            listener,
            dispatcher,
            api,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HttpServerError> {
        let local_addr = self.listener.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted HTTP connection from {}", peer_addr);
                    let dispatcher = self.dispatcher.clone();
                    let api = self.api.clone();
                    let head_timeout = self.config.head_timeout;
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(socket, peer_addr, dispatcher, api, head_timeout)
                                .await
                        {
                            debug!("Connection from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        info!("HTTP server on {} stopped", local_addr);
        Ok(())
    }
}

/// Read until a complete request head is buffered.
///
/// Returns `None` when the peer closes the connection between requests.
async fn read_head(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    head_timeout: Duration,
) -> Result<Option<RequestHead>, HttpServerError> {
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            if let Some(head) = RequestHead::parse(buf)? {
                return Ok(Some(head));
            }
        }

        let n = tokio::time::timeout(head_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| HttpServerError::HeadTimeout)??;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Dispatcher,
    api: Router,
    head_timeout: Duration,
) -> Result<(), HttpServerError> {
    let _ = stream.set_nodelay(true);
    let mut buf = Vec::with_capacity(4096);

    loop {
        let head = match read_head(&mut stream, &mut buf, head_timeout).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(HttpServerError::BadRequest(e)) => {
                debug!("Malformed request from {}: {}", peer_addr, e);
                let _ = stream
                    .write_all(&simple_response(StatusCode::BAD_REQUEST, "Bad Request"))
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let upgrade = head.is_upgrade();

        let session = match dispatcher.resolve(head.host()) {
            Ok(session) => session,
            Err(RouteError::NoSubdomain) => {
                trace!("{} {} from {} served by the API", head.method, head.path, peer_addr);
                return serve_api(stream, peer_addr, buf, api).await;
            }
            Err(e) if upgrade => {
                // nothing sensible to answer on an upgrade; drop the connection
                debug!("Dropping upgrade from {}: {}", peer_addr, e);
                return Ok(());
            }
            Err(RouteError::MissingHost) => {
                stream
                    .write_all(&simple_response(
                        StatusCode::BAD_REQUEST,
                        "Host header is required",
                    ))
                    .await?;
                return Ok(());
            }
            Err(RouteError::UnknownTunnel(id)) => {
                debug!("Request from {} for unknown tunnel '{}'", peer_addr, id);
                stream
                    .write_all(&simple_response(StatusCode::NOT_FOUND, "404"))
                    .await?;
                return Ok(());
            }
        };

        if upgrade {
            if let Err(e) = session.handle_upgrade(&mut stream, &buf).await {
                debug!(
                    "Upgrade from {} to '{}' failed: {}",
                    peer_addr,
                    session.id(),
                    e
                );
            }
            return Ok(());
        }

        match session.handle_request(&mut stream, &head, &buf).await {
            Ok(RequestOutcome::KeepAlive) => buf.clear(),
            Ok(RequestOutcome::Closed) => return Ok(()),
            Err(e) => {
                warn!(
                    "Request from {} to '{}' failed: {}",
                    peer_addr,
                    session.id(),
                    e
                );
                return Ok(());
            }
        }
    }
}

/// Serve the rest of the connection with the API router, replaying the bytes already read
async fn serve_api(
    stream: TcpStream,
    peer_addr: SocketAddr,
    buffered: Vec<u8>,
    api: Router,
) -> Result<(), HttpServerError> {
    let io = TokioIo::new(PrefixedIo::new(buffered, stream));
    let service = service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer_addr));
        api.clone().oneshot(req)
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!("API connection from {} ended: {}", peer_addr, e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_head_across_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\nHo").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b"st: foo.example.com\r\n\r\nextra").await.unwrap();
            stream
        });

        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_head(&mut server_side, &mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(head.host(), Some("foo.example.com"));
        assert_eq!(&buf[head.header_len..], b"extra");
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_head_clean_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(TcpStream::connect(addr).await.unwrap());

        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_head(&mut server_side, &mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn test_read_head_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();

        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let result = read_head(&mut server_side, &mut buf, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(HttpServerError::HeadTimeout)));
    }
}
