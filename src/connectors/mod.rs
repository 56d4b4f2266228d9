use std::{
    net::{Shutdown, SocketAddr},
    sync::{Arc, Mutex, OnceLock},
};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail, err_msg};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    common::set_keepalive,
    config::{ProxyConfig, ProxyType},
    context::TargetAddress,
    io::{Socket, SocketKind, StreamSocket},
};

mod direct;
mod http;
mod socks;

pub use direct::DirectConnector;
pub use http::HttpConnector;
pub use socks::SocksConnector;

/// Two-step upstream connection: reach the proxy, then ask it for the
/// destination. The resulting byte stream is exposed through `socket`.
#[async_trait]
pub trait ForwardProxy: Send + Sync {
    fn name(&self) -> &'static str;
    fn proxy_endpoint(&self) -> Option<TargetAddress>;
    fn dest_endpoint(&self) -> Option<TargetAddress>;
    async fn connect_proxy(&self, endpoint: &TargetAddress) -> Result<(), Error>;
    async fn connect_dest(&self, endpoint: &TargetAddress) -> Result<(), Error>;
    fn socket(&self) -> &dyn Socket;
}

pub type RemoteRef = Arc<dyn ForwardProxy>;

/// Builds the connector for `cfg` and the endpoint its first step dials.
/// `None` means there is no forward proxy and the tunnel server is dialed in
/// the destination step.
pub fn from_config(cfg: &ProxyConfig) -> Result<(RemoteRef, Option<TargetAddress>), Error> {
    if !cfg.use_proxy {
        return Ok((Arc::new(DirectConnector::default()), None));
    }
    if cfg.proxy_server.is_empty() {
        bail!("forward proxy enabled without proxyServer");
    }
    let endpoint = Some(cfg.endpoint());
    let remote: RemoteRef = match cfg.proxy_type {
        ProxyType::Socks5 => Arc::new(SocksConnector::default()),
        ProxyType::Http => Arc::new(HttpConnector::default()),
    };
    Ok((remote, endpoint))
}

/// TCP leg shared by all connectors.
///
/// The stream sits in `pending` while a proxy handshake still needs exclusive
/// access, and moves to `stream` once it carries tunnel bytes.
#[derive(Default)]
pub struct Upstream {
    closed: CancellationToken,
    pending: Mutex<Option<TcpStream>>,
    stream: OnceLock<StreamSocket>,
    proxy: OnceLock<TargetAddress>,
    dest: OnceLock<TargetAddress>,
}

impl Upstream {
    async fn dial(&self, endpoint: &TargetAddress) -> Result<TcpStream, Error> {
        if self.closed.is_cancelled() {
            bail!("connection closed before connect");
        }
        trace!("connecting to {}", endpoint);
        let stream = tokio::select! {
            biased;
            _ = self.closed.cancelled() => bail!("connect to {} cancelled", endpoint),
            r = endpoint.connect_tcp() => r.with_context(|| format!("connect to {}", endpoint))?,
        };
        stream.set_nodelay(true).context("set_nodelay")?;
        set_keepalive(&stream)?;
        trace!("connected to {:?}", stream.peer_addr());
        Ok(stream)
    }

    /// Dials `endpoint` and keeps the stream for a later handshake.
    pub async fn connect_pending(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        let _ = self.proxy.set(endpoint.clone());
        let stream = self.dial(endpoint).await?;
        let mut pending = self.pending.lock().map_err(|_| err_msg("lock poisoned"))?;
        if self.closed.is_cancelled() {
            bail!("connection closed during connect");
        }
        *pending = Some(stream);
        Ok(())
    }

    /// Dials the tunnel server at `endpoint` and starts carrying tunnel
    /// bytes right away.
    pub async fn connect_direct(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        let _ = self.dest.set(endpoint.clone());
        let stream = self.dial(endpoint).await?;
        self.install(stream)
    }

    pub fn take_pending(&self) -> Result<TcpStream, Error> {
        self.pending
            .lock()
            .map_err(|_| err_msg("lock poisoned"))?
            .take()
            .ok_or_else(|| err_msg("proxy not connected"))
    }

    pub fn install(&self, stream: TcpStream) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            bail!("connection closed during connect");
        }
        self.stream
            .set(StreamSocket::with_token(stream, self.closed.clone()))
            .map_err(|_| err_msg("upstream already connected"))
    }

    /// Runs a handshake on the pending stream, aborting if the socket is closed.
    pub async fn handshake<F, Fut>(&self, dest: &TargetAddress, f: F) -> Result<(), Error>
    where
        F: FnOnce(TcpStream) -> Fut + Send,
        Fut: Future<Output = Result<TcpStream, Error>> + Send,
    {
        let _ = self.dest.set(dest.clone());
        let stream = self.take_pending()?;
        let stream = tokio::select! {
            biased;
            _ = self.closed.cancelled() => bail!("handshake with proxy cancelled"),
            r = f(stream) => r?,
        };
        self.install(stream)
    }

    pub fn proxy_endpoint(&self) -> Option<TargetAddress> {
        self.proxy.get().cloned()
    }

    pub fn dest_endpoint(&self) -> Option<TargetAddress> {
        self.dest.get().cloned()
    }

    fn connected(&self) -> Result<&StreamSocket, Error> {
        self.stream
            .get()
            .ok_or_else(|| err_msg("upstream not connected"))
    }
}

#[async_trait]
impl Socket for Upstream {
    fn kind(&self) -> SocketKind {
        SocketKind::Stream
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.connected()?.local_addr()
    }

    fn peer_addr(&self) -> Result<SocketAddr, Error> {
        self.connected()?.peer_addr()
    }

    fn set_nodelay(&self) -> Result<(), Error> {
        self.connected()?.set_nodelay()
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.connected()?.recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        self.connected()?.send(buf).await
    }

    fn recv_available(&self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.stream.get() {
            Some(s) => s.recv_available(buf),
            None => Ok(0),
        }
    }

    fn shutdown(&self, how: Shutdown) -> Result<(), Error> {
        self.connected()?.shutdown(how)
    }

    fn close(&self) {
        self.closed.cancel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
        if let Some(s) = self.stream.get() {
            s.close();
        }
    }
}
