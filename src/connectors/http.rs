use async_trait::async_trait;
use easy_error::Error;
use tracing::trace;

use super::{ForwardProxy, Upstream};
use crate::{common::http::http_connect, context::TargetAddress, io::Socket};

#[derive(Default)]
pub struct HttpConnector {
    upstream: Upstream,
}

#[async_trait]
impl ForwardProxy for HttpConnector {
    fn name(&self) -> &'static str {
        "http"
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
                let resp = http_connect(&mut stream, &target).await?;
                trace!("http proxy answered {} {}", resp.code, resp.status);
                Ok(stream)
            })
            .await
    }

    fn socket(&self) -> &dyn Socket {
        &self.upstream
    }
}
