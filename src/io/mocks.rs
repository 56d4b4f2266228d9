use std::{
    collections::VecDeque,
    net::{Shutdown, SocketAddr},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use easy_error::{Error, bail};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Socket, SocketKind};

#[derive(Debug)]
enum MockRead {
    Data(Vec<u8>),
    Eof,
    Error,
}

/// Scripted socket: queued reads are handed out in order, writes are recorded.
pub struct MockSocket {
    kind: SocketKind,
    local: SocketAddr,
    reads: Mutex<VecDeque<MockRead>>,
    readable: Notify,
    sends: Mutex<Vec<Vec<u8>>>,
    max_send: Mutex<Option<usize>>,
    shutdowns: Mutex<Vec<Shutdown>>,
    closes: AtomicUsize,
    nodelay: AtomicBool,
    closed: CancellationToken,
}

impl Default for MockSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSocket {
    pub fn new() -> Self {
        Self::with_kind(SocketKind::Stream)
    }

    pub fn with_kind(kind: SocketKind) -> Self {
        Self {
            kind,
            local: SocketAddr::from(([127, 0, 0, 1], 1080)),
            reads: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            sends: Mutex::new(vec![]),
            max_send: Mutex::new(None),
            shutdowns: Mutex::new(vec![]),
            closes: AtomicUsize::new(0),
            nodelay: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn push_read(&self, data: &[u8]) {
        self.push(MockRead::Data(data.to_vec()));
    }

    pub fn push_eof(&self) {
        self.push(MockRead::Eof);
    }

    pub fn push_error(&self) {
        self.push(MockRead::Error);
    }

    fn push(&self, read: MockRead) {
        self.reads.lock().unwrap().push_back(read);
        self.readable.notify_one();
    }

    pub fn set_max_send(&self, max: Option<usize>) {
        *self.max_send.lock().unwrap() = max;
    }

    pub fn sends(&self) -> Vec<Vec<u8>> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sends().concat()
    }

    pub fn shutdowns(&self) -> Vec<Shutdown> {
        self.shutdowns.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay.load(Ordering::SeqCst)
    }

    /// Polls until at least `n` bytes were sent or a second elapsed.
    pub async fn wait_sent(&self, n: usize) -> Vec<u8> {
        for _ in 0..1000 {
            let sent = self.sent_bytes();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.sent_bytes()
    }

    pub async fn wait_closed(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(30), self.closed.cancelled())
            .await
            .is_ok()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn pop_read(&self, buf: &mut [u8], wait_for_eof: bool) -> Option<Result<usize, Error>> {
        let mut reads = self.reads.lock().unwrap();
        match reads.pop_front()? {
            MockRead::Data(mut data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    reads.push_front(MockRead::Data(data.split_off(n)));
                }
                Some(Ok(n))
            }
            MockRead::Eof if wait_for_eof => Some(Ok(0)),
            MockRead::Error if wait_for_eof => Some(Err(easy_error::err_msg("mock recv error"))),
            other => {
                reads.push_front(other);
                None
            }
        }
    }
}

#[async_trait]
impl Socket for MockSocket {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> Result<SocketAddr, Error> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    fn set_nodelay(&self) -> Result<(), Error> {
        self.nodelay.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            if self.closed.is_cancelled() {
                bail!("socket closed");
            }
            if let Some(r) = self.pop_read(buf, true) {
                return r;
            }
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => bail!("socket closed"),
                _ = self.readable.notified() => {}
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        if self.closed.is_cancelled() {
            bail!("socket closed");
        }
        let n = match *self.max_send.lock().unwrap() {
            Some(max) => buf.len().min(max),
            None => buf.len(),
        };
        if n > 0 {
            self.sends.lock().unwrap().push(buf[..n].to_vec());
        }
        Ok(n)
    }

    fn recv_available(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.closed.is_cancelled() {
            return Ok(0);
        }
        self.pop_read(buf, false).unwrap_or(Ok(0))
    }

    fn shutdown(&self, how: Shutdown) -> Result<(), Error> {
        self.shutdowns.lock().unwrap().push(how);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}
