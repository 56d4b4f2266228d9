//! Connection registry and per-connection relay.
//!
//! `ConnectionRegistry::handle` screens freshly accepted sockets, creates a
//! handler for each SOCKS5 client and keeps it in the live set until the
//! handler closes. Idle handlers are swept opportunistically on accept.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use easy_error::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, trace, warn};

use crate::{
    common::socks::SOCKS_VER_5,
    config::{Config, ProxyConfig},
    connectors::{self, RemoteRef},
    context::TargetAddress,
    crypto::{self, Codec},
    io::{SocketKind, SocketRef},
    server::Service,
    stats::{TrafficCounters, TrafficSink},
    strategy::StrategyRef,
};

mod handler;
#[cfg(test)]
pub(crate) mod mocks;
mod session;

pub use handler::{ConnectionHandler, HandlerState};
pub use session::{ConnectTimer, Session};

pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[async_trait]
pub trait RelayHandler: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn last_activity(&self) -> Instant;
    /// Begins serving in the background; `first_packet` is what the listener
    /// already read from the socket.
    fn start(self: Arc<Self>, first_packet: Vec<u8>);
    /// Idempotent.
    async fn close(&self);
}

pub type HandlerRef = Arc<dyn RelayHandler>;

pub type CodecFactory = Arc<dyn Fn(&str, &str) -> Result<Codec, Error> + Send + Sync>;
pub type ConnectorFactory =
    Arc<dyn Fn(&ProxyConfig) -> Result<(RemoteRef, Option<TargetAddress>), Error> + Send + Sync>;
pub type HandlerFactory = Arc<dyn Fn(HandlerContext) -> HandlerRef + Send + Sync>;

/// Collaborators shared by every handler.
pub struct RelayServices {
    pub strategy: Option<StrategyRef>,
    pub traffic: Arc<dyn TrafficSink>,
    pub codecs: CodecFactory,
    pub connectors: ConnectorFactory,
}

impl Default for RelayServices {
    fn default() -> Self {
        let codecs: CodecFactory = Arc::new(crypto::new_codec);
        let connectors: ConnectorFactory = Arc::new(connectors::from_config);
        Self {
            strategy: None,
            traffic: Arc::new(TrafficCounters::default()),
            codecs,
            connectors,
        }
    }
}

/// Everything a handler factory needs to build one handler.
pub struct HandlerContext {
    pub id: ConnectionId,
    pub config: Arc<Config>,
    pub services: Arc<RelayServices>,
    pub registry: Weak<ConnectionRegistry>,
    pub socket: SocketRef,
}

struct LiveSet {
    handlers: HashMap<ConnectionId, HandlerRef>,
    last_sweep: Instant,
}

pub struct ConnectionRegistry {
    config: Arc<Config>,
    services: Arc<RelayServices>,
    factory: HandlerFactory,
    live: Mutex<LiveSet>,
    next_id: AtomicU64,
    this: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    pub fn new(config: Arc<Config>, services: Arc<RelayServices>) -> Arc<Self> {
        let factory: HandlerFactory =
            Arc::new(|ctx: HandlerContext| ConnectionHandler::new(ctx) as HandlerRef);
        Self::with_handler_factory(config, services, factory)
    }

    pub fn with_handler_factory(
        config: Arc<Config>,
        services: Arc<RelayServices>,
        factory: HandlerFactory,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            services,
            factory,
            live: Mutex::new(LiveSet {
                handlers: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            next_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Takes ownership of `socket` if `first_packet` opens a SOCKS5 handshake.
    pub async fn handle(&self, first_packet: Vec<u8>, socket: SocketRef) -> bool {
        if socket.kind() != SocketKind::Stream
            || first_packet.len() < 2
            || first_packet[0] != SOCKS_VER_5
        {
            return false;
        }
        if let Err(e) = socket.set_nodelay() {
            warn!("{}: {:?}", e, e.cause);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler = (self.factory)(HandlerContext {
            id,
            config: self.config.clone(),
            services: self.services.clone(),
            registry: self.this.clone(),
            socket,
        });

        let stale: Vec<HandlerRef> = {
            let mut live = self.live.lock().await;
            live.handlers.insert(id, handler.clone());
            let now = Instant::now();
            if now.duration_since(live.last_sweep) > SWEEP_PERIOD {
                live.last_sweep = now;
                live.handlers
                    .values()
                    .filter(|h| now.duration_since(h.last_activity()) > HANDLER_TIMEOUT)
                    .cloned()
                    .collect()
            } else {
                vec![]
            }
        };
        for h in stale {
            debug!("{}: idle timeout, closing", h.id());
            h.close().await;
        }

        trace!("{}: accepted", id);
        handler.start(first_packet);
        true
    }

    pub async fn remove(&self, id: ConnectionId) {
        self.live.lock().await.handlers.remove(&id);
    }

    pub async fn stop(&self) {
        let handlers: Vec<HandlerRef> = self.live.lock().await.handlers.values().cloned().collect();
        debug!("closing {} connections", handlers.len());
        for h in handlers {
            h.close().await;
        }
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.handlers.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.live.lock().await.handlers.contains_key(&id)
    }
}

#[async_trait]
impl Service for ConnectionRegistry {
    fn name(&self) -> &str {
        "socks5-relay"
    }

    async fn handle(&self, first_packet: Vec<u8>, socket: SocketRef) -> bool {
        ConnectionRegistry::handle(self, first_packet, socket).await
    }

    async fn stop(&self) {
        ConnectionRegistry::stop(self).await
    }
}
