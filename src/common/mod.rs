use std::{
    net::{SocketAddr, SocketAddrV4},
    time::Duration,
};

use easy_error::{Error, ResultExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

pub mod http;
pub mod socks;

// map v6 socket addr into v4 if possible
pub fn try_map_v4_addr(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(v6) = addr {
        if let Some(v4a) = v6.ip().to_ipv4_mapped() {
            SocketAddr::V4(SocketAddrV4::new(v4a, v6.port()))
        } else {
            addr
        }
    } else {
        addr
    }
}

pub fn set_keepalive(stream: &TcpStream) -> Result<(), Error> {
    let params = TcpKeepalive::new().with_time(Duration::from_secs(10));
    SockRef::from(stream)
        .set_tcp_keepalive(&params)
        .context("set_keepalive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_v4_mapped_addresses() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:1080".parse().unwrap();
        assert_eq!(try_map_v4_addr(mapped), "127.0.0.1:1080".parse().unwrap());
        let v6: SocketAddr = "[::1]:1080".parse().unwrap();
        assert_eq!(try_map_v4_addr(v6), v6);
    }
}
