use std::{
    io::ErrorKind,
    net::{Shutdown, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// A connected socket usable from several tasks at once.
///
/// `close` faults out every pending `recv`/`send`; operations started after
/// it fail immediately.
#[async_trait]
pub trait Socket: Send + Sync {
    fn kind(&self) -> SocketKind;
    fn local_addr(&self) -> Result<SocketAddr, Error>;
    fn peer_addr(&self) -> Result<SocketAddr, Error>;
    fn set_nodelay(&self) -> Result<(), Error>;
    /// Returns 0 on orderly shutdown by the peer.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error>;
    async fn send(&self, buf: &[u8]) -> Result<usize, Error>;
    /// Copies whatever is already buffered by the OS without waiting.
    fn recv_available(&self, buf: &mut [u8]) -> Result<usize, Error>;
    fn shutdown(&self, how: Shutdown) -> Result<(), Error>;
    fn close(&self);
}

pub type SocketRef = Arc<dyn Socket>;

pub struct StreamSocket {
    stream: TcpStream,
    closed: CancellationToken,
}

impl StreamSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_token(stream, CancellationToken::new())
    }

    /// Shares `closed` with an owner that may cancel before the stream exists.
    pub fn with_token(stream: TcpStream, closed: CancellationToken) -> Self {
        Self { stream, closed }
    }
}

#[async_trait]
impl Socket for StreamSocket {
    fn kind(&self) -> SocketKind {
        SocketKind::Stream
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.stream.local_addr().context("local_addr")
    }

    fn peer_addr(&self) -> Result<SocketAddr, Error> {
        self.stream.peer_addr().context("peer_addr")
    }

    fn set_nodelay(&self) -> Result<(), Error> {
        self.stream.set_nodelay(true).context("set_nodelay")
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => bail!("socket closed"),
                r = self.stream.readable() => r.context("readable")?,
            }
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("recv"),
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => bail!("socket closed"),
                r = self.stream.writable() => r.context("writable")?,
            }
            match self.stream.try_write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("send"),
            }
        }
    }

    fn recv_available(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.closed.is_cancelled() || buf.is_empty() {
            return Ok(0);
        }
        match self.stream.try_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e).context("recv"),
        }
    }

    fn shutdown(&self, how: Shutdown) -> Result<(), Error> {
        SockRef::from(&self.stream).shutdown(how).context("shutdown")
    }

    fn close(&self) {
        self.closed.cancel();
        // the peer may already be gone
        let _ = SockRef::from(&self.stream).shutdown(Shutdown::Both);
    }
}
