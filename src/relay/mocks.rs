use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use easy_error::{Error, bail};
use tokio::time::Instant;

use super::{ConnectionId, ConnectionRegistry, HandlerContext, RelayHandler};
use crate::{
    config::Server,
    connectors::ForwardProxy,
    context::TargetAddress,
    crypto::{Codec, CryptoError, Decryptor, Encryptor},
    io::{Socket, mocks::MockSocket},
    strategy::Strategy,
};

pub struct MockHandler {
    id: ConnectionId,
    registry: Weak<ConnectionRegistry>,
    last_activity: Mutex<Instant>,
    started: Mutex<Option<Vec<u8>>>,
    closes: AtomicUsize,
}

impl MockHandler {
    pub fn new(ctx: &HandlerContext) -> Self {
        Self {
            id: ctx.id,
            registry: ctx.registry.clone(),
            last_activity: Mutex::new(Instant::now()),
            started: Mutex::new(None),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn started_with(&self) -> Option<Vec<u8>> {
        self.started.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayHandler for MockHandler {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    fn start(self: Arc<Self>, first_packet: Vec<u8>) {
        *self.started.lock().unwrap() = Some(first_packet);
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    /// Never completes until the socket is closed.
    Hang,
}

/// Forward proxy backed by a `MockSocket`, with scripted connect outcomes.
pub struct MockRemote {
    pub socket: MockSocket,
    proxy: ConnectBehavior,
    dest: ConnectBehavior,
    proxy_calls: Mutex<Vec<TargetAddress>>,
    dest_calls: Mutex<Vec<TargetAddress>>,
}

impl MockRemote {
    pub fn new(proxy: ConnectBehavior, dest: ConnectBehavior) -> Self {
        Self {
            socket: MockSocket::new(),
            proxy,
            dest,
            proxy_calls: Mutex::new(vec![]),
            dest_calls: Mutex::new(vec![]),
        }
    }

    pub fn proxy_calls(&self) -> Vec<TargetAddress> {
        self.proxy_calls.lock().unwrap().clone()
    }

    pub fn dest_calls(&self) -> Vec<TargetAddress> {
        self.dest_calls.lock().unwrap().clone()
    }

    async fn act(&self, behavior: ConnectBehavior) -> Result<(), Error> {
        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail => bail!("connection refused"),
            ConnectBehavior::Hang => {
                self.socket.closed().await;
                bail!("socket closed")
            }
        }
    }
}

#[async_trait]
impl ForwardProxy for MockRemote {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn proxy_endpoint(&self) -> Option<TargetAddress> {
        self.proxy_calls().first().cloned()
    }

    fn dest_endpoint(&self) -> Option<TargetAddress> {
        self.dest_calls().first().cloned()
    }

    async fn connect_proxy(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        self.proxy_calls.lock().unwrap().push(endpoint.clone());
        self.act(self.proxy).await
    }

    async fn connect_dest(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        self.dest_calls.lock().unwrap().push(endpoint.clone());
        self.act(self.dest).await
    }

    fn socket(&self) -> &dyn Socket {
        &self.socket
    }
}

/// Counts codec calls; the transform is a byte-wise XOR.
#[derive(Default)]
pub struct CodecRecorder {
    pub addr_len: Mutex<Option<usize>>,
    pub encryptor_disposed: AtomicUsize,
    pub decryptor_disposed: AtomicUsize,
}

const XOR_KEY: u8 = 0x5A;

struct XorEncryptor(Arc<CodecRecorder>);
struct XorDecryptor(Arc<CodecRecorder>);

fn xor_into(input: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
    if out.len() < input.len() {
        return Err(CryptoError::BufferTooSmall {
            need: input.len(),
            have: out.len(),
        });
    }
    for (o, i) in out.iter_mut().zip(input) {
        *o = i ^ XOR_KEY;
    }
    Ok(input.len())
}

impl Encryptor for XorEncryptor {
    fn set_addr_len(&mut self, len: usize) {
        *self.0.addr_len.lock().unwrap() = Some(len);
    }

    fn encrypt(&mut self, plain: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        xor_into(plain, out)
    }

    fn dispose(&mut self) {
        self.0.encryptor_disposed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Decryptor for XorDecryptor {
    fn decrypt(&mut self, cipher: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        xor_into(cipher, out)
    }

    fn dispose(&mut self) {
        self.0.decryptor_disposed.fetch_add(1, Ordering::SeqCst);
    }
}

impl CodecRecorder {
    pub fn codec(self: &Arc<Self>) -> Codec {
        Codec {
            encryptor: Box::new(XorEncryptor(self.clone())),
            decryptor: Box::new(XorDecryptor(self.clone())),
        }
    }

    pub fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ XOR_KEY).collect()
    }
}

#[derive(Default)]
pub struct MockStrategy {
    pub server: Option<Arc<Server>>,
    pub picks: Mutex<Vec<(Option<SocketAddr>, TargetAddress)>>,
    pub latencies: Mutex<Vec<Duration>>,
    pub failures: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl Strategy for MockStrategy {
    fn name(&self) -> &str {
        "mock"
    }

    fn pick_server(&self, client: Option<SocketAddr>, dest: &TargetAddress) -> Option<Arc<Server>> {
        self.picks.lock().unwrap().push((client, dest.clone()));
        self.server.clone()
    }

    fn update_latency(&self, _server: &Server, latency: Duration) {
        self.latencies.lock().unwrap().push(latency);
    }

    fn update_last_read(&self, _server: &Server) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn update_last_write(&self, _server: &Server) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_failure(&self, _server: &Server) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}
