//! Wire-level helpers shared by the burrow relay crates
//!
//! The relay never rewrites proxied traffic. These helpers only look far enough into
//! HTTP/1.x messages to find the `Host` header, spot upgrades, and tell where one
//! message ends so that a reverse connection can be handed back to its pool.

pub mod host;
pub mod http;
pub mod response;

pub use host::normalize_host;
pub use http::{
    BodyFraming, BodyTracker, HttpParseError, RequestHead, ResponseHead, MAX_HEAD_SIZE,
};
pub use response::simple_response;
