use async_trait::async_trait;
use easy_error::Error;
use tracing::trace;

use super::{ForwardProxy, Upstream};
use crate::{common::socks::socks5_connect, context::TargetAddress, io::Socket};

#[derive(Default)]
pub struct SocksConnector {
    upstream: Upstream,
}

#[async_trait]
impl ForwardProxy for SocksConnector {
    fn name(&self) -> &'static str {
        "socks5"
    }

    fn proxy_endpoint(&self) -> Option<TargetAddress> {
        self.upstream.proxy_endpoint()
    }

    fn dest_endpoint(&self) -> Option<TargetAddress> {
        self.upstream.dest_endpoint()
    }

    async fn connect_proxy(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        self.upstream.connect_pending(endpoint).await
    }

    async fn connect_dest(&self, endpoint: &TargetAddress) -> Result<(), Error> {
        let target = endpoint.clone();
        self.upstream
            .handshake(endpoint, |mut stream| async move {
                let bound = socks5_connect(&mut stream, &target).await?;
                trace!("socks5 proxy bound {} for {}", bound, target);
                Ok(stream)
            })
            .await
    }

    fn socket(&self) -> &dyn Socket {
        &self.upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[test(tokio::test)]
    async fn connect_via_socks5_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr: TargetAddress = listener.local_addr().unwrap().into();
        let proxy = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            s.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            s.write_all(&[5, 0]).await.unwrap();
            let mut req = [0u8; 10];
            s.read_exact(&mut req).await.unwrap();
            assert_eq!(req, [5, 1, 0, 1, 10, 1, 2, 3, 0x20, 0xC4]);
            s.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            let mut data = [0u8; 4];
            s.read_exact(&mut data).await.unwrap();
            data
        });

        let connector = SocksConnector::default();
        connector.connect_proxy(&proxy_addr).await.unwrap();
        connector
            .connect_dest(&"10.1.2.3:8388".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(connector.socket().send(b"ping").await.unwrap(), 4);
        assert_eq!(&proxy.await.unwrap(), b"ping");
    }

    #[test(tokio::test)]
    async fn dest_before_proxy_fails() {
        let connector = SocksConnector::default();
        assert!(
            connector
                .connect_dest(&"10.1.2.3:8388".parse().unwrap())
                .await
                .is_err()
        );
    }
}
