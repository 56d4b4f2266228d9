use std::{net::Shutdown, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connectors::RemoteRef;

/// The remote side of a handler while it connects and relays.
#[derive(Clone)]
pub struct Session {
    remote: RemoteRef,
}

impl Session {
    pub fn new(remote: RemoteRef) -> Self {
        Self { remote }
    }

    pub fn close(&self) {
        let socket = self.remote.socket();
        if let Err(e) = socket.shutdown(Shutdown::Both) {
            trace!("remote shutdown: {}", e);
        }
        socket.close();
    }
}

/// One-shot deferred action. Disarming only prevents an action that has not
/// fired yet; one already running is left to finish.
pub struct ConnectTimer {
    cancel: CancellationToken,
}

impl ConnectTimer {
    pub fn arm<F>(after: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => action.await,
            }
        });
        Self { cancel }
    }

    pub fn disarm(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConnectTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
