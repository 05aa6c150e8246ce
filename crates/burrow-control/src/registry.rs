//! Session registry: identifier allocation, quota accounting and session lifetime
//!
//! Allocation is serialized by a single lock that is never held across an await. The
//! identifier is reserved in the map before the session's pool starts listening, so a
//! concurrent request for the same identifier always observes the reservation.

use crate::id::generate_id;
use crate::session::Session;
use burrow_pool::{PoolConfig, PoolError};
use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Too many tunnels from {address} (limit {limit})")]
    QuotaExceeded { address: IpAddr, limit: usize },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Tunnel '{0}' was replaced before it finished starting")]
    Superseded(String),
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum live sessions a single source address may hold
    pub max_sessions_per_source: usize,
    /// Configuration for every session's connection pool
    pub pool: PoolConfig,
    /// How long a request waits for a reverse socket
    pub acquire_timeout: Duration,
    /// How long a session may sit with no reverse socket before it closes itself
    pub offline_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_source: 5,
            pool: PoolConfig::default(),
            acquire_timeout: Duration::from_secs(30),
            offline_grace: Duration::from_secs(5),
        }
    }
}

/// Result of a successful [`SessionRegistry::create`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedSession {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
}

/// Owner of every live session
#[derive(Clone)]
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: Arc<DashMap<String, Arc<Session>>>,
    tunnels: Arc<AtomicUsize>,
    alloc_lock: Arc<Mutex<()>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            tunnels: Arc::new(AtomicUsize::new(0)),
            alloc_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn alloc_lock(&self) -> MutexGuard<'_, ()> {
        self.alloc_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session, preferring `requested_id`.
    ///
    /// When the identifier is taken, a requester holding the session's secret (or offering a
    /// secret to a session that has none) evicts it and takes the identifier over. Anyone else
    /// receives a fresh random identifier.
    pub async fn create(
        &self,
        requested_id: &str,
        secret: Option<&str>,
        source: Option<IpAddr>,
    ) -> Result<CreatedSession, RegistryError> {
        let (session, evicted) = self.reserve(requested_id, secret, source)?;
        if let Some(old) = evicted {
            info!("Tunnel '{}' reclaimed by its owner, closing previous session", old.id());
            self.retire(&old);
        }

        let port = match session.start(self.config.offline_grace).await {
            Ok(port) => port,
            Err(e) => {
                warn!("Failed to start tunnel '{}': {}", session.id(), e);
                self.sessions
                    .remove_if(session.id(), |_, s| Arc::ptr_eq(s, &session));
                session.close();
                return Err(e.into());
            }
        };

        if !self.commit(&session) {
            debug!("Tunnel '{}' was replaced while starting", session.id());
            self.sessions
                .remove_if(session.id(), |_, s| Arc::ptr_eq(s, &session));
            session.close();
            return Err(RegistryError::Superseded(session.id().to_string()));
        }
        self.watch(session.clone());

        info!(
            "Tunnel '{}' created on port {} (source {:?}, {} tunnels)",
            session.id(),
            port,
            source,
            self.tunnel_count()
        );

        Ok(CreatedSession {
            id: session.id().to_string(),
            port,
            max_conn_count: session.max_conn_count(),
        })
    }

    /// Quota check, collision policy and reservation, as one step
    fn reserve(
        &self,
        requested_id: &str,
        secret: Option<&str>,
        source: Option<IpAddr>,
    ) -> Result<(Arc<Session>, Option<Arc<Session>>), RegistryError> {
        let _guard = self.alloc_lock();

        if let Some(address) = source {
            let limit = self.config.max_sessions_per_source;
            if self.count_by_source(address) >= limit {
                warn!("Rejecting tunnel request from {}: quota of {} reached", address, limit);
                return Err(RegistryError::QuotaExceeded { address, limit });
            }
        }

        let existing = self.sessions.get(requested_id).map(|e| e.value().clone());
        let mut evicted = None;
        let id = match existing {
            None => requested_id.to_string(),
            Some(existing) if existing.is_closed() => {
                self.sessions.remove(requested_id);
                self.forget_count(&existing);
                requested_id.to_string()
            }
            Some(existing) => match secret {
                Some(secret) if !existing.has_secret() || existing.secret_matches(secret) => {
                    self.sessions.remove(requested_id);
                    evicted = Some(existing);
                    requested_id.to_string()
                }
                _ => {
                    let id = self.vacant_random_id();
                    debug!("Tunnel id '{}' is taken, assigning '{}'", requested_id, id);
                    id
                }
            },
        };

        let session = Session::new(
            id.clone(),
            secret.map(str::to_string),
            source,
            self.config.pool.clone(),
            self.config.acquire_timeout,
        );
        self.sessions.insert(id, session.clone());
        Ok((session, evicted))
    }

    /// Count a started session if its reservation survived the start
    fn commit(&self, session: &Arc<Session>) -> bool {
        let _guard = self.alloc_lock();
        let still_registered = self
            .sessions
            .get(session.id())
            .is_some_and(|e| Arc::ptr_eq(e.value(), session));
        if !still_registered || session.is_closed() {
            return false;
        }
        session.mark_counted();
        self.tunnels.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn vacant_random_id(&self) -> String {
        loop {
            let id = generate_id();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn forget_count(&self, session: &Session) {
        if session.take_counted() {
            self.tunnels.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn retire(&self, session: &Session) {
        self.forget_count(session);
        session.close();
    }

    /// Drop the entry once the session closes from its own side (e.g. the agent went away)
    fn watch(&self, session: Arc<Session>) {
        let sessions = self.sessions.clone();
        let tunnels = self.tunnels.clone();
        tokio::spawn(async move {
            session.closed().await;
            let removed = sessions
                .remove_if(session.id(), |_, s| Arc::ptr_eq(s, &session))
                .is_some();
            if session.take_counted() {
                tunnels.fetch_sub(1, Ordering::SeqCst);
            }
            if removed {
                info!("Tunnel '{}' removed after close", session.id());
            }
        });
    }

    /// Remove and close a session. Returns false if there was none.
    pub fn remove(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        self.retire(&session);
        info!("Tunnel '{}' removed", id);
        true
    }

    /// Find a live session
    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .filter(|s| !s.is_closed())
    }

    /// Live sessions (including reservations still starting) held by `address`
    pub fn count_by_source(&self, address: IpAddr) -> usize {
        self.sessions
            .iter()
            .filter(|e| !e.value().is_closed() && e.value().source() == Some(address))
            .count()
    }

    /// Number of started, not yet removed sessions
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    /// Identifiers of every registered session, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Close every session
    pub fn shutdown(&self) {
        let ids = self.list();
        let count = ids.len();
        for id in ids {
            self.remove(&id);
        }
        info!("Session registry shut down ({} tunnels closed)", count);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
