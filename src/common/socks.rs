use std::net::{IpAddr, SocketAddr};

use easy_error::{Error, ResultExt, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::context::TargetAddress;

pub const SOCKS_VER_5: u8 = 5u8;
pub const SOCKS_CMD_CONNECT: u8 = 1u8;
pub const SOCKS_CMD_UDP_ASSOCIATE: u8 = 3u8;
pub const SOCKS_ATYP_INET4: u8 = 1u8;
pub const SOCKS_ATYP_DOMAIN: u8 = 3u8;
pub const SOCKS_ATYP_INET6: u8 = 4u8;
pub const SOCKS_AUTH_NONE: u8 = 0u8;
pub const SOCKS_REPLY_OK: u8 = 0u8;
pub const SOCKS_REPLY_REJECTED: u8 = 0x5Bu8;

pub const ADDR_ATYP_LEN: usize = 1;
pub const ADDR_PORT_LEN: usize = 2;
/// VER CMD RSV ATYP plus the first address byte.
pub const CMD_HEADER_LEN: usize = 3 + ADDR_ATYP_LEN + 1;

pub const VERSION_ACCEPT: [u8; 2] = [SOCKS_VER_5, SOCKS_AUTH_NONE];
pub const VERSION_REJECT: [u8; 2] = [0, SOCKS_REPLY_REJECTED];
pub const CONNECT_REPLY: [u8; 10] = [SOCKS_VER_5, SOCKS_REPLY_OK, 0, SOCKS_ATYP_INET4, 0, 0, 0, 0, 0, 0];

/// Bytes still to read once `atyp` and the byte after it are known.
pub fn address_bytes_remaining(atyp: u8, second: u8) -> Option<usize> {
    match atyp {
        SOCKS_ATYP_INET4 => Some(4 + ADDR_PORT_LEN - 1),
        SOCKS_ATYP_DOMAIN => Some(second as usize + ADDR_PORT_LEN),
        SOCKS_ATYP_INET6 => Some(16 + ADDR_PORT_LEN - 1),
        _ => None,
    }
}

/// Total length of an `ATYP ADDR PORT` header.
pub fn address_header_len(atyp: u8, second: u8) -> Option<usize> {
    match atyp {
        SOCKS_ATYP_INET4 => Some(ADDR_ATYP_LEN + 4 + ADDR_PORT_LEN),
        SOCKS_ATYP_DOMAIN => Some(ADDR_ATYP_LEN + 1 + second as usize + ADDR_PORT_LEN),
        SOCKS_ATYP_INET6 => Some(ADDR_ATYP_LEN + 16 + ADDR_PORT_LEN),
        _ => None,
    }
}

/// Decodes an `ATYP ADDR PORT` header at the start of `buf`, returning the
/// address and the header length.
pub fn parse_address(buf: &[u8]) -> Result<(TargetAddress, usize), Error> {
    if buf.len() < 2 {
        bail!("address header too short: {}", buf.len());
    }
    let atyp = buf[0];
    let Some(len) = address_header_len(atyp, buf[1]) else {
        bail!("not supported addr type: {}", atyp);
    };
    if buf.len() < len {
        bail!("address header truncated: need {} got {}", len, buf.len());
    }
    let port = u16::from_be_bytes([buf[len - 2], buf[len - 1]]);
    let target = match atyp {
        SOCKS_ATYP_INET4 => {
            let ip = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            (ip, port).into()
        }
        SOCKS_ATYP_DOMAIN => {
            let domain = String::from_utf8_lossy(&buf[2..len - 2]).into_owned();
            TargetAddress::DomainPort(domain, port)
        }
        _ => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[1..17]);
            (ip, port).into()
        }
    };
    Ok((target, len))
}

pub fn encode_address(target: &TargetAddress, out: &mut Vec<u8>) {
    match target {
        TargetAddress::DomainPort(domain, port) => {
            out.push(SOCKS_ATYP_DOMAIN);
            out.push(domain.len() as u8);
            out.extend_from_slice(domain.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
        TargetAddress::SocketAddr(a) => {
            match a.ip() {
                IpAddr::V4(v4) => {
                    out.push(SOCKS_ATYP_INET4);
                    out.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    out.push(SOCKS_ATYP_INET6);
                    out.extend_from_slice(&v6.octets());
                }
            }
            out.extend_from_slice(&a.port().to_be_bytes());
        }
    }
}

/// Reply to UDP ASSOCIATE carrying the local endpoint of the client socket,
/// in the socket's own address family.
pub fn udp_associate_reply(local: SocketAddr) -> Vec<u8> {
    let mut ret = vec![SOCKS_VER_5, SOCKS_REPLY_OK, 0];
    encode_address(&local.into(), &mut ret);
    ret
}

/// Runs a no-auth SOCKS5 CONNECT for `target` over `socket` and returns the
/// bound address reported by the proxy.
pub async fn socks5_connect<IO>(socket: &mut IO, target: &TargetAddress) -> Result<TargetAddress, Error>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    if let TargetAddress::DomainPort(domain, _) = target {
        if domain.len() > u8::MAX as usize {
            bail!("domain name too long for socks5: {} bytes", domain.len());
        }
    }

    // pre auth negotiation
    socket
        .write_all(&[SOCKS_VER_5, 1, SOCKS_AUTH_NONE])
        .await
        .context("write greeting")?;
    socket.flush().await.context("flush")?;
    let mut selected = [0u8; 2];
    socket.read_exact(&mut selected).await.context("read method")?;
    trace!("peer_method: {}", selected[1]);
    if selected[0] != SOCKS_VER_5 {
        bail!("Unknown socks version: {}", selected[0]);
    }
    if selected[1] != SOCKS_AUTH_NONE {
        bail!("not supported auth method: {}", selected[1]);
    }

    // request
    let mut req = vec![SOCKS_VER_5, SOCKS_CMD_CONNECT, 0];
    encode_address(target, &mut req);
    socket.write_all(&req).await.context("write request")?;
    socket.flush().await.context("flush")?;

    let mut head = [0u8; 4];
    socket.read_exact(&mut head).await.context("read reply")?;
    if head[0] != SOCKS_VER_5 {
        bail!("Unknown socks version: {}", head[0]);
    }
    if head[1] != SOCKS_REPLY_OK {
        bail!("socks5 connect to {} failed: reply {}", target, head[1]);
    }
    let bound = match head[3] {
        SOCKS_ATYP_INET4 => {
            let dst = socket.read_u32().await.context("read dst")?;
            let port = socket.read_u16().await.context("read port")?;
            (dst, port).into()
        }
        SOCKS_ATYP_DOMAIN => {
            let len = socket.read_u8().await.context("read domain length")?;
            let mut domain = vec![0u8; len as usize];
            socket.read_exact(&mut domain).await.context("read domain")?;
            let port = socket.read_u16().await.context("read port")?;
            TargetAddress::DomainPort(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        SOCKS_ATYP_INET6 => {
            let mut dst = [0u8; 16];
            socket.read_exact(&mut dst).await.context("read dst")?;
            let port = socket.read_u16().await.context("read port")?;
            (dst, port).into()
        }
        atyp => bail!("not supported addr type: {}", atyp),
    };
    trace!("socks5 bound address: {}", bound);
    Ok(bound)
}
