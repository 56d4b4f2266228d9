use easy_error::{Error, ResultExt, bail, err_msg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::context::TargetAddress;

const MAX_HEADER_LEN: usize = 8192;

#[derive(Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub code: u16,
    pub status: String,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn parse(head: &str) -> Result<Self, Error> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().ok_or_else(|| err_msg("empty response"))?;
        trace!("response={}", status_line);
        let a: Vec<&str> = status_line.splitn(3, ' ').collect();
        if a.len() < 2 || !a[0].starts_with("HTTP/") {
            bail!("bad response: {:?}", status_line);
        }
        let version = a[0].into();
        let code = a[1].parse().context("failed to parse response code")?;
        let status = a.get(2).copied().unwrap_or_default().into();
        let headers = lines
            .filter(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            .collect();
        Ok(Self {
            version,
            code,
            status,
            headers,
        })
    }
}

/// Reads a response head byte by byte so nothing past the blank line is
/// consumed from `socket`.
async fn read_head<IO>(socket: &mut IO) -> Result<String, Error>
where
    IO: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let b = socket.read_u8().await.context("read response")?;
        buf.push(b);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() >= MAX_HEADER_LEN {
            bail!("response header too long");
        }
    }
    String::from_utf8(buf).context("parse utf8")
}

/// Issues `CONNECT target` and requires a 2xx answer.
pub async fn http_connect<IO>(socket: &mut IO, target: &TargetAddress) -> Result<HttpResponse, Error>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.to_string();
    let req = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n\r\n",
        authority
    );
    socket.write_all(req.as_bytes()).await.context("write request")?;
    socket.flush().await.context("flush")?;
    let head = read_head(socket).await?;
    let resp = HttpResponse::parse(&head)?;
    if !(200..300).contains(&resp.code) {
        bail!("proxy refused CONNECT {}: {} {}", target, resp.code, resp.status);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    #[test]
    fn parse_response_head() {
        let resp =
            HttpResponse::parse("HTTP/1.1 200 Connection established\r\nVia: x\r\n\r\n").unwrap();
        assert_eq!(resp.version, "HTTP/1.1");
        assert_eq!(resp.code, 200);
        assert_eq!(resp.status, "Connection established");
        assert_eq!(resp.headers, vec![("Via".to_owned(), "x".to_owned())]);
        assert!(HttpResponse::parse("SSH-2.0 hello\r\n\r\n").is_err());
    }

    #[test(tokio::test)]
    async fn connect_leaves_tunnel_bytes_unread() {
        let mut stream = Builder::new()
            .write(b"CONNECT 1.2.3.4:5 HTTP/1.1\r\nHost: 1.2.3.4:5\r\nProxy-Connection: keep-alive\r\n\r\n")
            .read(b"HTTP/1.1 200 OK\r\n\r\nDATA")
            .build();
        http_connect(&mut stream, &"1.2.3.4:5".parse().unwrap())
            .await
            .unwrap();
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"DATA");
    }

    #[test(tokio::test)]
    async fn connect_refused() {
        let mut stream = Builder::new()
            .write(b"CONNECT [::1]:8388 HTTP/1.1\r\nHost: [::1]:8388\r\nProxy-Connection: keep-alive\r\n\r\n")
            .read(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .build();
        assert!(
            http_connect(&mut stream, &"[::1]:8388".parse().unwrap())
                .await
                .is_err()
        );
    }
}
