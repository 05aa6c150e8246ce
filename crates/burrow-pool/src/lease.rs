//! Leased reverse sockets

use crate::pool::PoolShared;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A reverse socket leased from a [`ConnectionPool`](crate::ConnectionPool).
///
/// The holder is solely responsible for it: dropping the lease closes the socket, while
/// [`release`](Self::release) offers it back to the pool for another request.
pub struct PooledSocket {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    pool: Arc<PoolShared>,
}

impl PooledSocket {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, pool: Arc<PoolShared>) -> Self {
        Self {
            stream: Some(stream),
            peer,
            pool,
        }
    }

    /// Address of the agent end of this reverse connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Return the socket to the idle set. Returns false if it was closed instead.
    pub fn release(mut self) -> bool {
        let stream = self.stream.take();
        self.pool.give_back(stream.map(|s| (s, self.peer)))
    }

    fn io(&mut self) -> io::Result<Pin<&mut TcpStream>> {
        self.stream
            .as_mut()
            .map(Pin::new)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            self.pool.give_back(None);
        }
    }
}

impl std::fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSocket")
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for PooledSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().io() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().io() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io() {
            Ok(stream) => stream.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
