//! Session control plane for the burrow relay
//!
//! Owns the registry of live tunnel sessions, the identifier collision policy and
//! per-source quotas, and the proxy adapter that pipes public traffic through a
//! session's reverse connection pool.

pub mod id;
pub mod policy;
pub mod registry;
pub mod relay;
pub mod session;

pub use id::generate_id;
pub use policy::{is_valid_identifier, SubdomainError, SubdomainPolicy};
pub use registry::{CreatedSession, RegistryConfig, RegistryError, SessionRegistry};
pub use relay::ProxyError;
pub use session::{RequestOutcome, Session, SessionStats};
