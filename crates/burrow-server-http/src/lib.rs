//! Public HTTP entry point of the relay
//!
//! Accepts public connections, reads request heads, and hands each request either to the
//! tunnel session its `Host` names or to the relay's own API.

pub mod prefixed;
pub mod server;

pub use prefixed::PrefixedIo;
pub use server::{HttpServer, HttpServerConfig, HttpServerError};
