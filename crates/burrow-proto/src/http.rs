//! HTTP/1.x head parsing and message framing using httparse.
//!
//! Heads are parsed from the raw bytes already read off a socket; the bytes themselves are
//! forwarded untouched. [`BodyTracker`] then follows the body framing so the caller knows
//! exactly where a message ends (RFC 7230 §3.3.3).

use thiserror::Error;
use tracing::trace;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Largest request or response head accepted before giving up on a connection
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// HTTP parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("Malformed HTTP message: {0}")]
    Malformed(String),

    #[error("HTTP head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Invalid chunked encoding: {0}")]
    InvalidChunk(&'static str),
}

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    Empty,
    /// `Content-Length` bytes follow the head
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Body runs until the sender closes the connection (responses only)
    CloseDelimited,
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP version (0 for HTTP/1.0, 1 for HTTP/1.1)
    pub version: u8,
    pub headers: Vec<(String, String)>,
    /// Bytes consumed by the request line and headers (including the final CRLF)
    pub header_len: usize,
    pub framing: BodyFraming,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub header_len: usize,
    pub framing: BodyFraming,
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// True when a comma separated header (e.g. `Connection`) lists `token`
fn has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    // chunked must be the final transfer coding to delimit the message
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|(_, v)| v.split(','))
        .last()
        .is_some_and(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<u64>, HttpParseError> {
    let mut found: Option<u64> = None;
    for (_, value) in headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        let parsed = value
            .parse::<u64>()
            .map_err(|_| HttpParseError::Malformed(format!("bad Content-Length: {}", value)))?;
        if found.is_some_and(|prev| prev != parsed) {
            return Err(HttpParseError::Malformed(
                "conflicting Content-Length headers".to_string(),
            ));
        }
        found = Some(parsed);
    }
    Ok(found)
}

fn keep_alive(version: u8, headers: &[(String, String)]) -> bool {
    if has_token(headers, "connection", "close") {
        return false;
    }
    version >= 1 || has_token(headers, "connection", "keep-alive")
}

impl RequestHead {
    /// Parse a request head from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the head is still incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, HttpParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let header_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(HttpParseError::HeadTooLarge(MAX_HEAD_SIZE));
                }
                return Ok(None);
            }
            Err(e) => return Err(HttpParseError::Malformed(e.to_string())),
        };

        let headers = collect_headers(req.headers);
        let framing = if is_chunked(&headers) {
            BodyFraming::Chunked
        } else {
            match content_length(&headers)? {
                Some(0) | None => BodyFraming::Empty,
                Some(n) => BodyFraming::Length(n),
            }
        };

        let head = Self {
            method: req.method.unwrap_or("GET").to_string(),
            path: req.path.unwrap_or("/").to_string(),
            version: req.version.unwrap_or(1),
            headers,
            header_len,
            framing,
        };
        trace!(
            "Parsed request head: {} {} (framing={:?})",
            head.method,
            head.path,
            head.framing
        );
        Ok(Some(head))
    }

    /// Value of the first header named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Raw `Host` header value, if present and non-empty
    pub fn host(&self) -> Option<&str> {
        self.header("host").filter(|h| !h.is_empty())
    }

    /// Whether the client asked to switch protocols (e.g. WebSocket)
    pub fn is_upgrade(&self) -> bool {
        has_token(&self.headers, "connection", "upgrade") && self.header("upgrade").is_some()
    }

    /// Whether the client is willing to send another request on this connection
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    pub fn is_head_request(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

impl ResponseHead {
    /// Parse a response head from the start of `buf`.
    ///
    /// `head_request` must be true when answering a `HEAD` request, whose response never
    /// carries a body regardless of its headers.
    pub fn parse(buf: &[u8], head_request: bool) -> Result<Option<Self>, HttpParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        let header_len = match resp.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(HttpParseError::HeadTooLarge(MAX_HEAD_SIZE));
                }
                return Ok(None);
            }
            Err(e) => return Err(HttpParseError::Malformed(e.to_string())),
        };

        let status = resp.code.unwrap_or(0);
        let headers = collect_headers(resp.headers);
        let framing = if head_request || matches!(status, 100..=199 | 204 | 304) {
            BodyFraming::Empty
        } else if is_chunked(&headers) {
            BodyFraming::Chunked
        } else {
            match content_length(&headers)? {
                Some(0) => BodyFraming::Empty,
                Some(n) => BodyFraming::Length(n),
                None => BodyFraming::CloseDelimited,
            }
        };

        Ok(Some(Self {
            status,
            version: resp.version.unwrap_or(1),
            headers,
            header_len,
            framing,
        }))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// 1xx responses other than `101` are followed by the final response
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }

    /// Whether the origin will accept another request on this connection
    pub fn keep_alive(&self) -> bool {
        self.framing != BodyFraming::CloseDelimited && keep_alive(self.version, &self.headers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size { value: u64, digits: usize, in_ext: bool },
    SizeLf { value: u64 },
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Done,
}

/// Incremental body-boundary tracker.
///
/// Bytes are fed as they are relayed; `feed` reports how many of them belong to the current
/// body so anything after the end can be recognised as the start of another message.
#[derive(Debug, Clone)]
pub struct BodyTracker {
    framing: BodyFraming,
    remaining: u64,
    chunk: ChunkState,
}

impl BodyTracker {
    pub fn new(framing: BodyFraming) -> Self {
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            _ => 0,
        };
        Self {
            framing,
            remaining,
            chunk: ChunkState::Size {
                value: 0,
                digits: 0,
                in_ext: false,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.framing {
            BodyFraming::Empty => true,
            BodyFraming::Length(_) => self.remaining == 0,
            BodyFraming::Chunked => self.chunk == ChunkState::Done,
            BodyFraming::CloseDelimited => false,
        }
    }

    /// Feed body bytes; returns the number of bytes that belong to this body.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, HttpParseError> {
        match self.framing {
            BodyFraming::Empty => Ok(0),
            BodyFraming::CloseDelimited => Ok(data.len()),
            BodyFraming::Length(_) => {
                let take = (data.len() as u64).min(self.remaining);
                self.remaining -= take;
                Ok(take as usize)
            }
            BodyFraming::Chunked => self.feed_chunked(data),
        }
    }

    fn feed_chunked(&mut self, data: &[u8]) -> Result<usize, HttpParseError> {
        let mut pos = 0;
        while pos < data.len() && self.chunk != ChunkState::Done {
            if let ChunkState::Data(left) = self.chunk {
                let take = ((data.len() - pos) as u64).min(left);
                pos += take as usize;
                self.chunk = if take == left {
                    ChunkState::DataCr
                } else {
                    ChunkState::Data(left - take)
                };
                continue;
            }

            let b = data[pos];
            pos += 1;
            self.chunk = match self.chunk {
                ChunkState::Size {
                    value,
                    digits,
                    in_ext,
                } => match b {
                    b'\r' if digits > 0 => ChunkState::SizeLf { value },
                    b'\r' => return Err(HttpParseError::InvalidChunk("missing chunk size")),
                    b';' => ChunkState::Size {
                        value,
                        digits,
                        in_ext: true,
                    },
                    _ if in_ext => ChunkState::Size {
                        value,
                        digits,
                        in_ext,
                    },
                    b' ' | b'\t' => ChunkState::Size {
                        value,
                        digits,
                        in_ext,
                    },
                    _ => {
                        let digit = (b as char)
                            .to_digit(16)
                            .ok_or(HttpParseError::InvalidChunk("invalid chunk size"))?;
                        let value = value
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit as u64))
                            .ok_or(HttpParseError::InvalidChunk("chunk size overflow"))?;
                        ChunkState::Size {
                            value,
                            digits: digits + 1,
                            in_ext,
                        }
                    }
                },
                ChunkState::SizeLf { value } => match b {
                    b'\n' if value == 0 => ChunkState::TrailerStart,
                    b'\n' => ChunkState::Data(value),
                    _ => return Err(HttpParseError::InvalidChunk("expected LF after size")),
                },
                ChunkState::DataCr => match b {
                    b'\r' => ChunkState::DataLf,
                    _ => return Err(HttpParseError::InvalidChunk("expected CR after data")),
                },
                ChunkState::DataLf => match b {
                    b'\n' => ChunkState::Size {
                        value: 0,
                        digits: 0,
                        in_ext: false,
                    },
                    _ => return Err(HttpParseError::InvalidChunk("expected LF after data")),
                },
                ChunkState::TrailerStart => match b {
                    b'\r' => ChunkState::FinalLf,
                    _ => ChunkState::TrailerLine,
                },
                ChunkState::TrailerLine => match b {
                    b'\r' => ChunkState::TrailerLf,
                    _ => ChunkState::TrailerLine,
                },
                ChunkState::TrailerLf => match b {
                    b'\n' => ChunkState::TrailerStart,
                    _ => return Err(HttpParseError::InvalidChunk("expected LF in trailer")),
                },
                ChunkState::FinalLf => match b {
                    b'\n' => ChunkState::Done,
                    _ => return Err(HttpParseError::InvalidChunk("expected final LF")),
                },
                ChunkState::Data(_) | ChunkState::Done => unreachable!(),
            };
        }
        Ok(pos)
    }
}
