use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    common::{set_keepalive, try_map_v4_addr},
    config::Config,
    crypto::RECV_SIZE,
    io::{SocketRef, StreamSocket},
    relay::{ConnectionRegistry, RelayServices},
};

/// How long a new connection may stay silent before its first packet.
pub const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(30);

/// A consumer of freshly accepted connections. Each service is offered the
/// first packet in turn; the first one returning `true` owns the socket.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, first_packet: Vec<u8>, socket: SocketRef) -> bool;
    async fn stop(&self);
}

pub struct RelayServer {
    pub config: Arc<Config>,
    services: Vec<Arc<dyn Service>>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        Self::with_services(config, RelayServices::default())
    }

    pub fn with_services(config: Config, services: RelayServices) -> Self {
        let config = Arc::new(config);
        let registry = ConnectionRegistry::new(config.clone(), Arc::new(services));
        Self {
            config,
            services: vec![registry as Arc<dyn Service>],
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn from_config_file(path: &str) -> Result<Self, Error> {
        let config = Config::load(path).await?;
        config.verify()?;
        Ok(Self::new(config))
    }

    /// Cancelling the token stops the accept loop and closes every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<(), Error> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {}", addr))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        let local = listener.local_addr().context("local addr")?;
        info!("listening on {}", local);
        if let Some(server) = self.config.current_server() {
            info!("current server: {}", server.friendly_name());
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("interrupted, shutting down");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(x) => x,
                        Err(e) => {
                            warn!("accept: {}", e);
                            continue;
                        }
                    };
                    let services = self.services.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatch(services, stream, peer).await {
                            debug!("{}: {}: {:?}", peer, e, e.cause);
                        }
                    });
                }
            }
        }

        for service in &self.services {
            trace!("stopping {}", service.name());
            service.stop().await;
        }
        Ok(())
    }
}

async fn dispatch(
    services: Vec<Arc<dyn Service>>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    let peer = try_map_v4_addr(peer);
    if let Err(e) = set_keepalive(&stream) {
        trace!("{}: {}", peer, e);
    }
    let socket: SocketRef = Arc::new(StreamSocket::new(stream));

    let mut buf = vec![0u8; RECV_SIZE];
    let n = match tokio::time::timeout(FIRST_PACKET_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(r) => r.context("read first packet")?,
        Err(_) => {
            socket.close();
            bail!("no first packet within {:?}", FIRST_PACKET_TIMEOUT);
        }
    };
    buf.truncate(n);
    trace!("{}: first packet {} bytes", peer, n);

    for service in &services {
        if service.handle(buf.clone(), socket.clone()).await {
            trace!("{}: handled by {}", peer, service.name());
            return Ok(());
        }
    }
    debug!("{}: no service accepted the connection", peer);
    socket.close();
    Ok(())
}
