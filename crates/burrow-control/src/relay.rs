//! Byte relays between a public connection and a leased reverse socket
//!
//! Bytes are always forwarded exactly as read. The framing trackers only decide when an
//! exchange is over and whether the reverse socket can serve another request.

use burrow_proto::{BodyTracker, HttpParseError, RequestHead, ResponseHead};
use burrow_pool::PoolError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Failures scoped to a single proxied request or upgrade
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to lease reverse connection: {0}")]
    Acquire(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a relayed request/response exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exchange {
    /// Both messages completed and both ends accept another request
    Reusable,
    /// The exchange ended in a way that leaves neither connection reusable
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseProgress {
    Pending,
    Complete { keep_alive: bool },
    SwitchingProtocols,
}

/// Follows one response (plus any interim 1xx heads) through the relayed byte stream
struct ResponseTracker {
    head_request: bool,
    head_buf: Vec<u8>,
    body: Option<BodyTracker>,
    keep_alive: bool,
    received: usize,
}

impl ResponseTracker {
    fn new(head_request: bool) -> Self {
        Self {
            head_request,
            head_buf: Vec::new(),
            body: None,
            keep_alive: false,
            received: 0,
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<ResponseProgress, HttpParseError> {
        self.received += data.len();
        if self.body.is_some() {
            return self.feed_body(data);
        }

        self.head_buf.extend_from_slice(data);
        loop {
            let Some(head) = ResponseHead::parse(&self.head_buf, self.head_request)? else {
                return Ok(ResponseProgress::Pending);
            };
            self.head_buf = self.head_buf.split_off(head.header_len);

            if head.is_switching_protocols() {
                return Ok(ResponseProgress::SwitchingProtocols);
            }
            if head.is_interim() {
                trace!("Relayed interim {} response", head.status);
                continue;
            }

            self.keep_alive = head.keep_alive();
            self.body = Some(BodyTracker::new(head.framing));
            let rest = std::mem::take(&mut self.head_buf);
            return self.feed_body(&rest);
        }
    }

    fn feed_body(&mut self, data: &[u8]) -> Result<ResponseProgress, HttpParseError> {
        let Some(body) = self.body.as_mut() else {
            return Ok(ResponseProgress::Pending);
        };
        let used = body.feed(data)?;
        if body.is_complete() {
            // bytes past the end of the response mean the origin is out of step
            Ok(ResponseProgress::Complete {
                keep_alive: self.keep_alive && used == data.len(),
            })
        } else {
            Ok(ResponseProgress::Pending)
        }
    }
}

/// Relay one HTTP/1.x request and its response.
///
/// `buffered` holds every byte read from the client so far, starting with the request head.
/// When the exchange can no longer be followed (pipelined requests, protocol switch, unparsable
/// framing) the relay falls back to a transparent splice and reports [`Exchange::Finished`].
pub(crate) async fn relay_request<C, U>(
    client: &mut C,
    upstream: &mut U,
    head: &RequestHead,
    buffered: &[u8],
    label: &str,
) -> Result<Exchange, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    upstream.write_all(buffered).await?;

    let mut request_body = BodyTracker::new(head.framing);
    let early_body = &buffered[head.header_len.min(buffered.len())..];
    match request_body.feed(early_body) {
        Ok(used) if used == early_body.len() => {}
        Ok(_) => {
            debug!("Pipelined request on '{}', switching to transparent relay", label);
            splice(client, upstream, label).await;
            return Ok(Exchange::Finished);
        }
        Err(e) => {
            debug!("Unframed request body on '{}' ({}), relaying transparently", label, e);
            splice(client, upstream, label).await;
            return Ok(Exchange::Finished);
        }
    }

    let request_keep_alive = head.keep_alive();
    let mut response = ResponseTracker::new(head.is_head_request());
    let mut client_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        tokio::select! {
            // Client → Agent
            result = client.read(&mut client_buf) => {
                let n = match result {
                    Ok(0) => {
                        debug!("Client closed connection mid-exchange on '{}'", label);
                        return Ok(Exchange::Finished);
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Client read error on '{}': {}", label, e);
                        return Ok(Exchange::Finished);
                    }
                };
                upstream.write_all(&client_buf[..n]).await?;

                let in_step = !request_body.is_complete()
                    && matches!(request_body.feed(&client_buf[..n]), Ok(used) if used == n);
                if !in_step {
                    debug!("Client sent bytes outside the current request on '{}'", label);
                    splice(client, upstream, label).await;
                    return Ok(Exchange::Finished);
                }
            }

            // Agent → Client
            result = upstream.read(&mut upstream_buf) => {
                let n = match result {
                    Ok(0) => {
                        if response.received == 0 {
                            debug!("Reverse connection for '{}' closed before responding", label);
                            client
                                .write_all(&burrow_proto::simple_response(
                                    http::StatusCode::BAD_GATEWAY,
                                    "Bad Gateway",
                                ))
                                .await?;
                        }
                        return Ok(Exchange::Finished);
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Reverse connection read error on '{}': {}", label, e);
                        return Ok(Exchange::Finished);
                    }
                };
                client.write_all(&upstream_buf[..n]).await?;

                match response.feed(&upstream_buf[..n]) {
                    Ok(ResponseProgress::Pending) => {}
                    Ok(ResponseProgress::Complete { keep_alive }) => {
                        if !request_body.is_complete() {
                            debug!("Response on '{}' finished before the request body", label);
                            return Ok(Exchange::Finished);
                        }
                        client.flush().await?;
                        return Ok(if keep_alive && request_keep_alive {
                            Exchange::Reusable
                        } else {
                            Exchange::Finished
                        });
                    }
                    Ok(ResponseProgress::SwitchingProtocols) => {
                        debug!("Protocol switch on '{}', relaying transparently", label);
                        splice(client, upstream, label).await;
                        return Ok(Exchange::Finished);
                    }
                    Err(e) => {
                        debug!("Unframed response on '{}' ({}), relaying transparently", label, e);
                        splice(client, upstream, label).await;
                        return Ok(Exchange::Finished);
                    }
                }
            }
        }
    }
}

/// Transparent bidirectional relay; returns as soon as either side closes or fails.
pub(crate) async fn splice<A, B>(a: &mut A, b: &mut B, label: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut b_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut relayed = (0usize, 0usize);

    loop {
        tokio::select! {
            result = a.read(&mut a_buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = b.write_all(&a_buf[..n]).await {
                        debug!("Relay write to agent failed on '{}': {}", label, e);
                        break;
                    }
                    relayed.0 += n;
                }
                Err(e) => {
                    debug!("Relay read from client failed on '{}': {}", label, e);
                    break;
                }
            },
            result = b.read(&mut b_buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = a.write_all(&b_buf[..n]).await {
                        debug!("Relay write to client failed on '{}': {}", label, e);
                        break;
                    }
                    relayed.1 += n;
                }
                Err(e) => {
                    debug!("Relay read from agent failed on '{}': {}", label, e);
                    break;
                }
            },
        }
    }

    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    debug!(
        "Relay on '{}' closed ({} bytes in, {} bytes out)",
        label, relayed.0, relayed.1
    );
}
