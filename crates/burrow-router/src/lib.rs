//! Host-based routing of public traffic to tunnel sessions
//!
//! The dispatcher holds no session state: it maps a `Host` header to a subdomain label and
//! looks that label up in the [`SessionRegistry`](burrow_control::SessionRegistry).

pub mod dispatcher;

pub use dispatcher::{Dispatcher, RouteError};
