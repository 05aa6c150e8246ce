//! Reverse connection pool for a single tunnel session
//!
//! The relay cannot dial into the agent's network. Instead the agent dials a per-session
//! port on the relay, and every accepted socket becomes spare capacity that can later be
//! matched 1:1 against a public request.

pub mod lease;
pub mod pool;

pub use lease::PooledSocket;
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolStats};
