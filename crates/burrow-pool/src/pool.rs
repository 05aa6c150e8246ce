//! Per-session listener and idle socket pool

use crate::lease::PooledSocket;
use futures::FutureExt;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound on how often idle sockets are checked for liveness
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Connection pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to bind tunnel listener on {address}: {reason}")]
    Listen { address: String, reason: String },

    #[error("No reverse connection available for '{session_id}' after {waited:?}")]
    NoAvailableConnection {
        session_id: String,
        waited: Duration,
    },

    #[error("Connection pool is shut down")]
    Closed,

    #[error("Connection pool already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle reverse sockets retained
    pub capacity: usize,
    /// Address the per-session listener binds (the port is always ephemeral)
    pub bind_ip: IpAddr,
    /// An idle socket parked longer than this is presumed dead and retired
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus leased sockets
    pub connected: usize,
    pub idle: usize,
    pub leased: usize,
}

struct IdleSocket {
    stream: TcpStream,
    peer: SocketAddr,
    parked_at: Instant,
}

impl IdleSocket {
    fn is_stale(&self, idle_timeout: Duration) -> bool {
        if self.parked_at.elapsed() >= idle_timeout {
            return true;
        }
        // A parked socket has nothing to say until it is leased; EOF or an error means the
        // agent went away. Pending data is left alone.
        let mut probe = [0u8; 1];
        matches!(
            self.stream.peek(&mut probe).now_or_never(),
            Some(Ok(0)) | Some(Err(_))
        )
    }
}

pub(crate) struct PoolShared {
    session_id: String,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleSocket>>,
    available: Notify,
    leased: AtomicUsize,
    connected_tx: watch::Sender<usize>,
    shutdown: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl PoolShared {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleSocket>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish idle + leased; callers hold the idle lock so updates are serialized
    fn publish(&self, idle: &VecDeque<IdleSocket>) {
        let connected = idle.len() + self.leased.load(Ordering::SeqCst);
        self.connected_tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    /// Register a freshly accepted reverse socket, or reject it when the pool is full
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _ = stream.set_nodelay(true);

        let mut idle = self.idle();
        if idle.len() >= self.config.capacity {
            debug!(
                "Rejecting reverse connection from {} for '{}': {} idle sockets (capacity {})",
                peer,
                self.session_id,
                idle.len(),
                self.config.capacity
            );
            return;
        }

        idle.push_back(IdleSocket {
            stream,
            peer,
            parked_at: Instant::now(),
        });
        debug!(
            "Reverse connection from {} registered for '{}' ({} idle)",
            peer,
            self.session_id,
            idle.len()
        );
        self.publish(&idle);
        drop(idle);

        self.available.notify_one();
    }

    /// Pop the oldest live idle socket and mark it leased
    fn take_idle(self: &Arc<Self>) -> Option<PooledSocket> {
        let mut idle = self.idle();
        let mut retired = false;

        let taken = loop {
            let Some(socket) = idle.pop_front() else {
                break None;
            };
            if socket.is_stale(self.config.idle_timeout) {
                debug!(
                    "Retiring stale reverse connection from {} for '{}'",
                    socket.peer, self.session_id
                );
                retired = true;
                continue;
            }
            self.leased.fetch_add(1, Ordering::SeqCst);
            break Some(socket);
        };

        if retired {
            self.publish(&idle);
        }
        drop(idle);

        taken.map(|s| {
            trace!("Leased reverse connection {} for '{}'", s.peer, self.session_id);
            PooledSocket::new(s.stream, s.peer, self.clone())
        })
    }

    /// Return a leased socket; `None` means the holder closed it
    pub(crate) fn give_back(&self, returned: Option<(TcpStream, SocketAddr)>) -> bool {
        let mut idle = self.idle();
        self.leased.fetch_sub(1, Ordering::SeqCst);

        let mut pooled = false;
        if let Some((stream, peer)) = returned {
            if !self.shutdown.is_cancelled() && idle.len() < self.config.capacity {
                idle.push_back(IdleSocket {
                    stream,
                    peer,
                    parked_at: Instant::now(),
                });
                pooled = true;
            } else {
                debug!(
                    "Closing released connection {} for '{}': pool full or shut down",
                    peer, self.session_id
                );
            }
        }
        self.publish(&idle);
        drop(idle);

        if pooled {
            self.available.notify_one();
        }
        pooled
    }

    fn retire_stale(&self) {
        let mut idle = self.idle();
        let before = idle.len();
        idle.retain(|socket| !socket.is_stale(self.config.idle_timeout));
        if idle.len() != before {
            debug!(
                "Retired {} stale reverse connection(s) for '{}'",
                before - idle.len(),
                self.session_id
            );
            self.publish(&idle);
        }
    }

    fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut idle = self.idle();
        let closed = idle.len();
        idle.clear();
        self.publish(&idle);
        drop(idle);

        info!(
            "Connection pool for '{}' shut down ({} idle sockets closed)",
            self.session_id, closed
        );
    }
}

async fn accept_loop(shared: Arc<PoolShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.admit(stream, peer),
                Err(e) => {
                    warn!("Failed to accept reverse connection for '{}': {}", shared.session_id, e);
                    // e.g. EMFILE; back off instead of spinning
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("Reverse listener for '{}' closed", shared.session_id);
}

async fn sweep_loop(shared: Arc<PoolShared>) {
    let period = shared.config.idle_timeout.min(MAX_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => shared.retire_stale(),
        }
    }
}

/// Reverse connection pool owned by exactly one session
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(session_id: impl Into<String>, config: PoolConfig) -> Self {
        let (connected_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(PoolShared {
                session_id: session_id.into(),
                config,
                idle: Mutex::new(VecDeque::new()),
                available: Notify::new(),
                leased: AtomicUsize::new(0),
                connected_tx,
                shutdown: CancellationToken::new(),
                local_addr: OnceLock::new(),
            }),
        }
    }

    /// Start listening on an ephemeral port and return it.
    ///
    /// Does not wait for the agent; the pool may sit empty until it dials in.
    pub async fn start(&self) -> Result<u16, PoolError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }
        if self.shared.local_addr.get().is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        let bind_addr = SocketAddr::new(self.shared.config.bind_ip, 0);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| PoolError::Listen {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        if self.shared.local_addr.set(local_addr).is_err() {
            return Err(PoolError::AlreadyStarted);
        }

        info!(
            "Tunnel '{}' accepting reverse connections on {}",
            self.shared.session_id, local_addr
        );

        tokio::spawn(accept_loop(self.shared.clone(), listener));
        tokio::spawn(sweep_loop(self.shared.clone()));

        Ok(local_addr.port())
    }

    /// Lease one idle socket (FIFO), waiting up to `timeout` for the agent to dial in.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledSocket, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.shutdown.is_cancelled() {
                return Err(PoolError::Closed);
            }
            if let Some(socket) = self.shared.take_idle() {
                return Ok(socket);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.shutdown.cancelled() => return Err(PoolError::Closed),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::NoAvailableConnection {
                        session_id: self.shared.session_id.clone(),
                        waited: timeout,
                    });
                }
            }
        }
    }

    /// Hand a still-usable socket back for a future lease.
    ///
    /// Returns false when the socket was closed instead (pool full or shut down).
    pub fn release(&self, socket: PooledSocket) -> bool {
        socket.release()
    }

    /// Stop listening and close every idle socket. Leased sockets stay with their holders.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Watch the number of connected (idle + leased) reverse sockets
    pub fn subscribe_connected(&self) -> watch::Receiver<usize> {
        self.shared.connected_tx.subscribe()
    }

    pub fn port(&self) -> Option<u16> {
        self.shared.local_addr.get().map(|addr| addr.port())
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle();
        let leased = self.shared.leased.load(Ordering::SeqCst);
        PoolStats {
            connected: idle.len() + leased,
            idle: idle.len(),
            leased,
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            idle_timeout: Duration::from_secs(60),
        }
    }

    async fn started_pool(capacity: usize) -> (ConnectionPool, SocketAddr) {
        let pool = ConnectionPool::new("test-pool", test_config(capacity));
        let port = pool.start().await.unwrap();
        (pool, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// A reverse socket the pool closed reads EOF
    async fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("socket was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_start_assigns_port() {
        let (pool, addr) = started_pool(10).await;
        assert_eq!(pool.port(), Some(addr.port()));
        assert_ne!(addr.port(), 0);
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_rejects_beyond_capacity() {
        let (pool, addr) = started_pool(2).await;

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 2).await;

        let mut extra = TcpStream::connect(addr).await.unwrap();
        assert_closed(&mut extra).await;
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_acquire_is_fifo() {
        let (pool, addr) = started_pool(10).await;

        let first = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 1).await;
        let _second = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 2).await;

        let leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(leased.peer_addr(), first.local_addr().unwrap());

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.connected, 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_empty() {
        let (pool, _addr) = started_pool(10).await;

        let result = pool.acquire(Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(PoolError::NoAvailableConnection { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_late_connection() {
        let (pool, addr) = started_pool(10).await;
        let pool = Arc::new(pool);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let agent = TcpStream::connect(addr).await.unwrap();
        let leased = waiter.await.unwrap().unwrap();
        assert_eq!(leased.peer_addr(), agent.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_release_makes_socket_available_again() {
        let (pool, addr) = started_pool(10).await;
        let mut agent = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 1).await;

        let mut leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        leased.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(pool.release(leased));
        assert_eq!(pool.stats().idle, 1);

        let again = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.peer_addr(), agent.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_lease_closes_socket() {
        let (pool, addr) = started_pool(10).await;
        let mut agent = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 1).await;

        let leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.stats().connected, 1);
        drop(leased);

        assert_eq!(pool.stats(), PoolStats::default());
        assert_closed(&mut agent).await;
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_shares_a_socket() {
        let (pool, addr) = started_pool(10).await;
        let pool = Arc::new(pool);

        let mut agents = Vec::new();
        for _ in 0..8 {
            agents.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for(|| pool.stats().idle == 8).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let leased = pool.acquire(Duration::from_secs(2)).await.unwrap();
                let peer = leased.peer_addr();
                // hold the lease until every task has one
                tokio::time::sleep(Duration::from_millis(50)).await;
                peer
            }));
        }

        let mut peers = HashSet::new();
        for handle in handles {
            assert!(peers.insert(handle.await.unwrap()));
        }
        assert_eq!(peers.len(), 8);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_stops_leasing() {
        let (pool, addr) = started_pool(10).await;
        let mut agent = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 1).await;

        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shut_down());
        assert_eq!(pool.stats().connected, 0);
        assert_closed(&mut agent).await;
        assert!(matches!(
            pool.acquire(Duration::from_secs(1)).await,
            Err(PoolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_leased_socket_usable() {
        let (pool, addr) = started_pool(10).await;
        let mut agent = TcpStream::connect(addr).await.unwrap();
        wait_for(|| pool.stats().idle == 1).await;

        let mut leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.shutdown();

        leased.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        // released after shutdown: closed rather than pooled
        assert!(!leased.release());
        assert_closed(&mut agent).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_retires_sockets() {
        let pool = ConnectionPool::new(
            "stale",
            PoolConfig {
                idle_timeout: Duration::from_secs(30),
                ..test_config(10)
            },
        );
        let port = pool.start().await.unwrap();
        let _agent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for(|| pool.stats().idle == 1).await;

        // the agent is still connected; only the idle bound retires it
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(pool.stats().idle, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        wait_for(|| pool.stats().idle == 0).await;
        assert_eq!(pool.stats().connected, 0);
    }

    #[tokio::test]
    async fn test_connected_count_follows_agent() {
        let (pool, addr) = started_pool(10).await;
        let mut connected = pool.subscribe_connected();

        let agent = TcpStream::connect(addr).await.unwrap();
        connected.wait_for(|n| *n == 1).await.unwrap();

        drop(agent);
        tokio::time::timeout(Duration::from_secs(3), connected.wait_for(|n| *n == 0))
            .await
            .expect("disconnect not observed")
            .unwrap();
    }
}
