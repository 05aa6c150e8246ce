//! End-to-end tests - full relay over real sockets
//!
//! These tests verify the complete tunnel flow:
//! 1. Relay bound on a loopback port
//! 2. Tunnel created through the registry or the HTTP API
//! 3. A fake agent dialing the tunnel's reverse connection port
//! 4. Public HTTP requests and upgrades relayed through the agent's sockets

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use burrow_lib::{
    HttpServerConfig, PoolConfig, RegistryConfig, Relay, RelayConfig, SessionRegistry,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow=debug")
        .with_test_writer()
        .try_init();
}

struct TestRelay {
    addr: SocketAddr,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestRelay {
    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

async fn start_relay() -> TestRelay {
    init_tracing();

    let config = RelayConfig {
        http: HttpServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            head_timeout: Duration::from_secs(5),
        },
        registry: RegistryConfig {
            pool: PoolConfig {
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..PoolConfig::default()
            },
            acquire_timeout: Duration::from_millis(300),
            offline_grace: Duration::from_secs(10),
            ..RegistryConfig::default()
        },
        domain: Some("example.com".to_string()),
        ..RelayConfig::default()
    };

    let relay = Relay::bind(config).await.unwrap();
    let addr = relay.local_addr().unwrap();
    let registry = relay.registry();
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            relay.run(shutdown).await.unwrap();
        })
    };
    info!("✓ Relay started on {}", addr);

    TestRelay {
        addr,
        registry,
        shutdown,
        handle,
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read one request or response head; `None` if the peer closed first
async fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(buf) {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            buf.drain(..end);
            return Some(head);
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Read one Content-Length delimited response
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let head = read_head(stream, &mut buf)
        .await
        .expect("connection closed before response head");
    let len = content_length(&head);

    let mut chunk = [0u8; 1024];
    while buf.len() < len {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    (head, buf)
}

/// Agent side of one reverse connection: answers every request with its path
fn spawn_agent(port: u16) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = Vec::new();
        let mut served = 0;
        while let Some(head) = read_head(&mut stream, &mut buf).await {
            let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
            let body = format!("hello from agent: {}", path);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
                break;
            }
            served += 1;
        }
        served
    })
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_end_to_end_tunnel_flow() {
    let relay = start_relay().await;

    // No session yet
    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: foo.example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 404"), "got: {}", head);
    assert_eq!(body, b"404");

    let created = relay.registry.create("foo", None, None).await.unwrap();
    assert_eq!(created.id, "foo");
    assert_eq!(created.max_conn_count, 10);
    info!("✓ Tunnel 'foo' accepting reverse connections on {}", created.port);

    let session = relay.registry.lookup("foo").unwrap();
    let agent = spawn_agent(created.port);
    wait_for(|| session.stats().idle_sockets == 1).await;

    // Two requests on one kept-alive public connection
    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    for path in ["/hello", "/again"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: foo.example.com\r\n\r\n", path);
        client.write_all(request.as_bytes()).await.unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"), "got: {}", head);
        assert_eq!(body, format!("hello from agent: {}", path).into_bytes());

        // the reverse socket goes back to idle once the exchange completes
        wait_for(|| {
            let stats = session.stats();
            stats.idle_sockets == 1 && stats.leased_sockets == 0
        })
        .await;
    }

    // Connection: close consumes the reverse socket
    client
        .write_all(b"GET /bye HTTP/1.1\r\nHost: foo.example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hello from agent: /bye");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_eq!(agent.await.unwrap(), 3);
    wait_for(|| session.stats().connected_sockets == 0).await;

    relay.stop().await;
}

#[tokio::test]
async fn test_create_tunnel_over_api() {
    let relay = start_relay().await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(b"GET /foobar HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);

    let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(created["id"], "foobar");
    assert_eq!(created["max_conn_count"], 10);
    assert_eq!(created["url"], "http://foobar.example.com");
    let port = created["port"].as_u64().unwrap() as u16;

    let _agent = spawn_agent(port);
    let session = relay.registry.lookup("foobar").unwrap();
    wait_for(|| session.stats().connected_sockets == 1).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(
            b"GET /api/tunnels/foobar/status HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let (_, body) = read_response(&mut client).await;
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["connected_sockets"], 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_missing_host_rejected() {
    let relay = start_relay().await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400"), "got: {}", head);
    assert_eq!(body, b"Host header is required");

    relay.stop().await;
}

#[tokio::test]
async fn test_no_agent_times_out() {
    let relay = start_relay().await;
    relay.registry.create("lonely", None, None).await.unwrap();

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: lonely.example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 504"), "got: {}", head);

    // the session survives a failed request
    assert!(relay.registry.lookup("lonely").is_some());

    relay.stop().await;
}

#[tokio::test]
async fn test_upgrade_is_relayed_both_ways() {
    let relay = start_relay().await;
    let created = relay.registry.create("socket", None, None).await.unwrap();
    let session = relay.registry.lookup("socket").unwrap();

    // Agent: accept the upgrade, then echo
    let agent = tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", created.port)).await.unwrap();
        let mut buf = Vec::new();
        let head = read_head(&mut stream, &mut buf).await.unwrap();
        assert!(head.contains("Upgrade: websocket"));
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();

        let mut chunk = [0u8; 64];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => stream.write_all(&chunk[..n]).await.unwrap(),
            }
        }
    });
    wait_for(|| session.stats().idle_sockets == 1).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(b"GET /ws HTTP/1.1\r\nHost: socket.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let head = read_head(&mut client, &mut buf).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "got: {}", head);

    client.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping");

    drop(client);
    agent.await.unwrap();
    wait_for(|| session.stats().connected_sockets == 0).await;

    relay.stop().await;
}

#[tokio::test]
async fn test_upgrade_to_unknown_tunnel_is_dropped() {
    let relay = start_relay().await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(b"GET /ws HTTP/1.1\r\nHost: ghost.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_tunnels() {
    let relay = start_relay().await;
    relay.registry.create("first", None, None).await.unwrap();
    relay.registry.create("second", None, None).await.unwrap();
    let registry = relay.registry.clone();

    relay.stop().await;
    assert!(registry.list().is_empty());
    assert_eq!(registry.tunnel_count(), 0);
}
