use std::{
    net::Shutdown,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail, err_msg};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, trace, warn};

use super::{
    ConnectionId, ConnectionRegistry, HandlerContext, RelayHandler, RelayServices,
    session::{ConnectTimer, Session},
};
use crate::{
    common::socks::{
        CMD_HEADER_LEN, CONNECT_REPLY, SOCKS_CMD_CONNECT, SOCKS_CMD_UDP_ASSOCIATE, SOCKS_VER_5,
        VERSION_ACCEPT, VERSION_REJECT, address_bytes_remaining, address_header_len,
        parse_address, udp_associate_reply,
    },
    config::{Config, Server},
    connectors::RemoteRef,
    context::TargetAddress,
    crypto::{BUFFER_SIZE, Codec, Decryptor, Encryptor, RECV_SIZE},
    io::{SocketRef, send_fully},
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Start,
    HandshakeVerSent,
    CmdReceived,
    ConnectAddrWait,
    UdpAddrWait,
    AddrResolved,
    ProxyConnecting,
    DestConnecting,
    Piping,
    IdleRead,
    Closed,
}

impl HandlerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Start,
            1 => Self::HandshakeVerSent,
            2 => Self::CmdReceived,
            3 => Self::ConnectAddrWait,
            4 => Self::UdpAddrWait,
            5 => Self::AddrResolved,
            6 => Self::ProxyConnecting,
            7 => Self::DestConnecting,
            8 => Self::Piping,
            9 => Self::IdleRead,
            _ => Self::Closed,
        }
    }
}

/// Fixed per-connection buffers. Upstream reads into `client_recv` and
/// encrypts into `remote_send`; downstream reads into `remote_recv` and
/// decrypts into `client_send`.
struct RelayBuffers {
    client_recv: Vec<u8>,
    client_send: Vec<u8>,
    remote_recv: Vec<u8>,
    remote_send: Vec<u8>,
}

impl RelayBuffers {
    fn new() -> Self {
        Self {
            client_recv: vec![0; BUFFER_SIZE],
            client_send: vec![0; BUFFER_SIZE],
            remote_recv: vec![0; BUFFER_SIZE],
            remote_send: vec![0; BUFFER_SIZE],
        }
    }
}

struct Lifecycle {
    closed: bool,
    session: Option<Session>,
}

/// Serves one SOCKS5 client from handshake to close.
pub struct ConnectionHandler {
    id: ConnectionId,
    config: Arc<Config>,
    services: Arc<RelayServices>,
    registry: Weak<ConnectionRegistry>,
    client: SocketRef,

    state: AtomicU8,
    command: AtomicU8,
    closed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    proxy_connected: AtomicBool,
    dest_connected: AtomicBool,
    timed_out: AtomicBool,
    client_shutdown: AtomicBool,
    remote_shutdown: AtomicBool,

    server: OnceLock<Arc<Server>>,
    destination: OnceLock<TargetAddress>,
    encryptor: Mutex<Option<Box<dyn Encryptor>>>,
    decryptor: Mutex<Option<Box<dyn Decryptor>>>,

    total_read: AtomicU64,
    total_written: AtomicU64,
    created: Instant,
    // millis since `created`
    last_activity: AtomicU64,
}

impl ConnectionHandler {
    pub fn new(ctx: HandlerContext) -> Arc<Self> {
        Arc::new(Self {
            id: ctx.id,
            config: ctx.config,
            services: ctx.services,
            registry: ctx.registry,
            client: ctx.socket,
            state: AtomicU8::new(HandlerState::Start as u8),
            command: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                closed: false,
                session: None,
            }),
            proxy_connected: AtomicBool::new(false),
            dest_connected: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            client_shutdown: AtomicBool::new(false),
            remote_shutdown: AtomicBool::new(false),
            server: OnceLock::new(),
            destination: OnceLock::new(),
            encryptor: Mutex::new(None),
            decryptor: Mutex::new(None),
            total_read: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The SOCKS command byte, 0 until the command header arrives.
    pub fn command(&self) -> u8 {
        self.command.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.get().cloned()
    }

    pub fn destination(&self) -> Option<TargetAddress> {
        self.destination.get().cloned()
    }

    /// Ciphertext bytes received from the tunnel server.
    pub fn total_read(&self) -> u64 {
        self.total_read.load(Ordering::Relaxed)
    }

    /// Ciphertext bytes sent to the tunnel server.
    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    /// Closed is terminal: a transition racing with `close` never reopens it.
    fn set_state(&self, state: HandlerState) {
        let closed = HandlerState::Closed as u8;
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur != closed).then_some(state as u8)
            });
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    async fn run(self: Arc<Self>, first_packet: Vec<u8>) {
        if let Err(e) = self.serve(&first_packet, RelayBuffers::new()).await {
            self.fail(e).await;
        }
    }

    async fn fail(&self, e: Error) {
        if self.is_closed() {
            trace!("{}: {}", self.id, e);
        } else {
            warn!("{}: {}: {:?}", self.id, e, e.cause);
        }
        self.close().await;
    }

    async fn serve(self: &Arc<Self>, first_packet: &[u8], mut bufs: RelayBuffers) -> Result<(), Error> {
        if first_packet.len() < 2 {
            bail!("handshake too short: {} bytes", first_packet.len());
        }
        // an unexpected version is answered but does not end the handshake
        let mut reply = if first_packet[0] == SOCKS_VER_5 {
            VERSION_ACCEPT
        } else {
            VERSION_REJECT
        };
        send_fully(self.client.as_ref(), &mut reply, 2)
            .await
            .context("send version reply")?;
        self.set_state(HandlerState::HandshakeVerSent);

        let buf = &mut bufs.client_recv;
        let n = self
            .client
            .recv(&mut buf[..CMD_HEADER_LEN])
            .await
            .context("read command")?;
        if n < CMD_HEADER_LEN {
            bail!("command header too short: {} bytes", n);
        }
        self.touch();
        self.set_state(HandlerState::CmdReceived);

        let cmd = buf[1];
        self.command.store(cmd, Ordering::SeqCst);
        match cmd {
            SOCKS_CMD_CONNECT => {
                let mut reply = CONNECT_REPLY;
                send_fully(self.client.as_ref(), &mut reply, CONNECT_REPLY.len())
                    .await
                    .context("send connect reply")?;
                self.set_state(HandlerState::ConnectAddrWait);
                let (addr_len, first_len) = self.read_address(buf).await?;
                self.start_connect(bufs, addr_len, first_len).await
            }
            SOCKS_CMD_UDP_ASSOCIATE => {
                self.set_state(HandlerState::UdpAddrWait);
                self.read_address(buf).await?;
                self.handle_udp_associate(buf).await
            }
            _ => bail!("unsupported socks command: {}", cmd),
        }
    }

    /// Reads the rest of `ATYP ADDR PORT` after the command header. The header
    /// is moved to the start of `buf`, followed by whatever else the client
    /// sent in the same read. Returns the header length and the total length.
    async fn read_address(&self, buf: &mut [u8]) -> Result<(usize, usize), Error> {
        let (atyp, second) = (buf[3], buf[4]);
        let (Some(remaining), Some(addr_len)) = (
            address_bytes_remaining(atyp, second),
            address_header_len(atyp, second),
        ) else {
            bail!("unsupported address type: {}", atyp);
        };

        // drop VER CMD RSV
        buf.copy_within(3..CMD_HEADER_LEN, 0);
        let n = self
            .client
            .recv(&mut buf[2..RECV_SIZE])
            .await
            .context("read address")?;
        if n < remaining {
            bail!("address too short: need {} got {}", remaining, n);
        }
        self.touch();

        let (dest, _) = parse_address(&buf[..addr_len])?;
        if self.config.verbose_logging {
            info!("connect to {}", dest);
        }
        let _ = self.destination.set(dest);
        self.set_state(HandlerState::AddrResolved);
        Ok((addr_len, n + 2))
    }

    async fn handle_udp_associate(&self, buf: &mut [u8]) -> Result<(), Error> {
        let local = self.client.local_addr()?;
        let mut reply = udp_associate_reply(local);
        let len = reply.len();
        send_fully(self.client.as_ref(), &mut reply, len)
            .await
            .context("send udp associate reply")?;
        self.set_state(HandlerState::IdleRead);

        // the TCP connection only signals liveness of the association
        loop {
            let n = self
                .client
                .recv(&mut buf[..RECV_SIZE])
                .await
                .context("read")?;
            if n == 0 {
                break;
            }
            self.touch();
        }
        self.close().await;
        Ok(())
    }

    fn pick_server(&self) -> Result<Arc<Server>, Error> {
        let server = match &self.services.strategy {
            Some(strategy) => {
                let dest = self
                    .destination
                    .get()
                    .ok_or_else(|| err_msg("destination not resolved"))?;
                strategy.pick_server(self.client.peer_addr().ok(), dest)
            }
            None => self.config.current_server(),
        };
        match server {
            Some(server) if !server.server.is_empty() => Ok(server),
            _ => bail!("No server configured"),
        }
    }

    async fn start_connect(
        self: &Arc<Self>,
        bufs: RelayBuffers,
        addr_len: usize,
        first_len: usize,
    ) -> Result<(), Error> {
        let server = self.pick_server()?;
        let _ = self.server.set(server.clone());

        let Codec {
            mut encryptor,
            mut decryptor,
        } = (self.services.codecs)(server.method.as_str(), server.password.as_str())?;
        encryptor.set_addr_len(addr_len);

        let (remote, proxy_endpoint) = (self.services.connectors)(&self.config.proxy)?;
        let server_endpoint = server.endpoint();
        let proxy_endpoint = proxy_endpoint.unwrap_or_else(|| server_endpoint.clone());

        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.closed {
                remote.socket().close();
                encryptor.dispose();
                decryptor.dispose();
                return Ok(());
            }
            *self.encryptor.lock().await = Some(encryptor);
            *self.decryptor.lock().await = Some(decryptor);
            lifecycle.session = Some(Session::new(remote.clone()));
        }

        self.set_state(HandlerState::ProxyConnecting);
        let timer = ConnectTimer::arm(
            self.config.proxy.connect_timeout(),
            self.clone().proxy_timeout(remote.clone()),
        );
        let r = remote.connect_proxy(&proxy_endpoint).await;
        timer.disarm();
        r.with_context(|| format!("connect to proxy {}", proxy_endpoint))?;
        self.proxy_connected.store(true, Ordering::SeqCst);
        if self.config.verbose_logging && self.config.proxy.use_proxy {
            info!("Socket connected to proxy {}", proxy_endpoint);
        }

        let started = Instant::now();
        self.set_state(HandlerState::DestConnecting);
        let timer = ConnectTimer::arm(
            server.connect_timeout(),
            self.clone().dest_timeout(remote.clone(), server.clone()),
        );
        let r = remote.connect_dest(&server_endpoint).await;
        timer.disarm();
        // a timed out connect has already been reported
        if r.is_err() && !self.is_closed() && !self.timed_out.load(Ordering::SeqCst) {
            if let Some(strategy) = &self.services.strategy {
                strategy.set_failure(&server);
            }
        }
        r.with_context(|| format!("connect to {}", server.friendly_name()))?;
        self.dest_connected.store(true, Ordering::SeqCst);

        let latency = started.elapsed();
        if let Some(strategy) = &self.services.strategy {
            strategy.update_latency(&server, latency);
        }
        self.services.traffic.update_latency(&server, latency);
        if self.config.verbose_logging {
            info!("Socket connected to ss server: {}", server.friendly_name());
        }

        self.set_state(HandlerState::Piping);
        self.start_pipe(remote, server, bufs, first_len).await
    }

    async fn proxy_timeout(self: Arc<Self>, remote: RemoteRef) {
        if self.proxy_connected.load(Ordering::SeqCst)
            || self.dest_connected.load(Ordering::SeqCst)
            || self.is_closed()
        {
            return;
        }
        self.timed_out.store(true, Ordering::SeqCst);
        match remote.proxy_endpoint() {
            Some(endpoint) => info!("Proxy {} timed out", endpoint),
            None => info!("{}: proxy timed out", self.id),
        }
        remote.socket().close();
        self.close().await;
    }

    async fn dest_timeout(self: Arc<Self>, remote: RemoteRef, server: Arc<Server>) {
        if self.dest_connected.load(Ordering::SeqCst) || self.is_closed() {
            return;
        }
        self.timed_out.store(true, Ordering::SeqCst);
        if let Some(strategy) = &self.services.strategy {
            strategy.set_failure(&server);
        }
        match remote.dest_endpoint() {
            Some(endpoint) => info!("{} ({}) timed out", server.friendly_name(), endpoint),
            None => info!("{} timed out", server.friendly_name()),
        }
        remote.socket().close();
        self.close().await;
    }

    async fn start_pipe(
        self: &Arc<Self>,
        remote: RemoteRef,
        server: Arc<Server>,
        bufs: RelayBuffers,
        first_len: usize,
    ) -> Result<(), Error> {
        let RelayBuffers {
            mut client_recv,
            client_send,
            remote_recv,
            remote_send,
        } = bufs;

        {
            let this = self.clone();
            let remote = remote.clone();
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = this
                    .pipe_downstream(&remote, &server, remote_recv, client_send)
                    .await
                {
                    this.fail(e).await;
                }
            });
        }

        let extra = self
            .client
            .recv_available(&mut client_recv[first_len..RECV_SIZE])
            .context("read available")?;
        if extra > 0 {
            trace!("{}: {} bytes joined the first packet", self.id, extra);
            self.touch();
        }
        self.pipe_upstream(&remote, &server, client_recv, remote_send, first_len + extra)
            .await
    }

    /// Client to tunnel server. `first_len` bytes of `recv_buf` are already
    /// pending from the handshake.
    async fn pipe_upstream(
        &self,
        remote: &RemoteRef,
        server: &Server,
        mut recv_buf: Vec<u8>,
        mut send_buf: Vec<u8>,
        first_len: usize,
    ) -> Result<(), Error> {
        let mut len = first_len;
        while len > 0 {
            let n = {
                let mut encryptor = self.encryptor.lock().await;
                let encryptor = encryptor
                    .as_mut()
                    .ok_or_else(|| err_msg("encryptor released"))?;
                encryptor
                    .encrypt(&recv_buf[..len], &mut send_buf)
                    .context("encrypt")?
            };
            self.total_written.fetch_add(n as u64, Ordering::Relaxed);
            self.services.traffic.update_outbound(server, n as u64);
            if let Some(strategy) = &self.services.strategy {
                strategy.update_last_write(server);
            }
            send_fully(remote.socket(), &mut send_buf, n)
                .await
                .context("send to server")?;

            len = self
                .client
                .recv(&mut recv_buf[..RECV_SIZE])
                .await
                .context("read from client")?;
            if len > 0 {
                self.touch();
            }
        }

        trace!("{}: client finished sending", self.id);
        remote
            .socket()
            .shutdown(Shutdown::Write)
            .context("shutdown server")?;
        self.remote_shutdown.store(true, Ordering::SeqCst);
        self.check_close().await;
        Ok(())
    }

    /// Tunnel server to client.
    async fn pipe_downstream(
        &self,
        remote: &RemoteRef,
        server: &Server,
        mut recv_buf: Vec<u8>,
        mut send_buf: Vec<u8>,
    ) -> Result<(), Error> {
        loop {
            let n = remote
                .socket()
                .recv(&mut recv_buf[..RECV_SIZE])
                .await
                .context("read from server")?;
            if n == 0 {
                break;
            }
            self.touch();
            self.total_read.fetch_add(n as u64, Ordering::Relaxed);
            self.services.traffic.update_inbound(server, n as u64);
            if let Some(strategy) = &self.services.strategy {
                strategy.update_last_read(server);
            }

            let plain = {
                let mut decryptor = self.decryptor.lock().await;
                let decryptor = decryptor
                    .as_mut()
                    .ok_or_else(|| err_msg("decryptor released"))?;
                decryptor
                    .decrypt(&recv_buf[..n], &mut send_buf)
                    .context("decrypt")?
            };
            if plain == 0 {
                continue;
            }
            send_fully(self.client.as_ref(), &mut send_buf, plain)
                .await
                .context("send to client")?;
        }

        trace!("{}: server finished sending", self.id);
        self.client
            .shutdown(Shutdown::Write)
            .context("shutdown client")?;
        self.client_shutdown.store(true, Ordering::SeqCst);
        self.check_close().await;
        Ok(())
    }

    async fn check_close(&self) {
        if self.client_shutdown.load(Ordering::SeqCst) && self.remote_shutdown.load(Ordering::SeqCst)
        {
            self.close().await;
        }
    }

    /// Releases everything exactly once, whoever calls first.
    pub async fn close(&self) {
        let session = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.closed {
                return;
            }
            lifecycle.closed = true;
            self.closed.store(true, Ordering::SeqCst);
            lifecycle.session.take()
        };
        self.state.store(HandlerState::Closed as u8, Ordering::SeqCst);
        match (self.server(), self.destination()) {
            (Some(server), Some(dest)) => debug!(
                "{}: closed {} via {}, {} bytes out, {} bytes in",
                self.id,
                dest,
                server.friendly_name(),
                self.total_written(),
                self.total_read()
            ),
            _ => debug!("{}: closed before connect", self.id),
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id).await;
        }

        if let Err(e) = self.client.shutdown(Shutdown::Both) {
            trace!("{}: client shutdown: {}", self.id, e);
        }
        self.client.close();
        if let Some(session) = session {
            session.close();
        }

        let mut encryptor = self.encryptor.lock().await;
        let mut decryptor = self.decryptor.lock().await;
        if let Some(mut e) = encryptor.take() {
            e.dispose();
        }
        if let Some(mut d) = decryptor.take() {
            d.dispose();
        }
    }
}

#[async_trait]
impl RelayHandler for ConnectionHandler {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.last_activity.load(Ordering::Relaxed))
    }

    fn start(self: Arc<Self>, first_packet: Vec<u8>) {
        tokio::spawn(self.run(first_packet));
    }

    async fn close(&self) {
        ConnectionHandler::close(self).await
    }
}
