//! Host header helpers

/// Normalize a `Host` header value: strip the port, trailing dot and lowercase.
///
/// `Foo.Example.com:8080` becomes `foo.example.com`; bracketed IPv6 literals keep their
/// address (`[::1]:80` becomes `::1`).
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };

    without_port.trim_end_matches('.').to_ascii_lowercase()
}
