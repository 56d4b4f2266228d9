use async_trait::async_trait;
use easy_error::Error;
use tracing::trace;

use super::{ForwardProxy, Upstream};
use crate::{context::TargetAddress, io::Socket};

/// No forward proxy. The first step has nothing to reach, so the tunnel
/// server is dialed in the destination step.
#[derive(Default)]
pub struct DirectConnector {
    upstream: Upstream,
}

#[async_trait]
impl ForwardProxy for DirectConnector {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn proxy_endpoint(&self) -> Option<TargetAddress> {
        self.upstream.proxy_endpoint()
    }

    fn dest_endpoint(&self) -> Option<TargetAddress> {
        self.upstream.dest_endpoint()
    }

    async fn connect_proxy(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        trace!("no forward proxy, skipping {}", endpoint);
        Ok(())
    }

    async fn connect_dest(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        self.upstream.connect_direct(endpoint).await
    }

    fn socket(&self) -> &dyn Socket {
        &self.upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    #[test(tokio::test)]
    async fn dials_in_destination_step() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: TargetAddress = listener.local_addr().unwrap().into();
        let direct = DirectConnector::default();
        direct.connect_proxy(&addr).await.unwrap();
        assert_eq!(direct.proxy_endpoint(), None);
        assert!(direct.socket().local_addr().is_err());

        let (r, accepted) = tokio::join!(direct.connect_dest(&addr), listener.accept());
        r.unwrap();
        assert_eq!(direct.proxy_endpoint(), None);
        assert_eq!(direct.dest_endpoint(), Some(addr));

        let (mut peer, _) = accepted.unwrap();
        assert_eq!(direct.socket().send(b"hi").await.unwrap(), 2);
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test(tokio::test)]
    async fn refused_destination_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: TargetAddress = listener.local_addr().unwrap().into();
        drop(listener);
        let direct = DirectConnector::default();
        direct.connect_proxy(&addr).await.unwrap();
        assert!(direct.connect_dest(&addr).await.is_err());
        assert!(direct.socket().local_addr().is_err());
    }
}
