//! Minimal HTTP/1.1 responses written directly to public sockets

use http::StatusCode;

/// Build a complete `text/plain` response that closes the connection.
pub fn simple_response(status: StatusCode, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}
