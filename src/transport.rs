//! Socket setup shared by every worker: a single reusable UDP socket for
//! ECHO/MESSAGE/the FILE header handshake, and a TCP listener for FILE
//! bodies (§4.1, §6.2).
//!
//! Binding is split into two steps, same as the teacher's
//! `bind_reusable_udp`: a [`socket2::Socket`] is configured with
//! `SO_REUSEADDR`/`SO_BROADCAST` before bind, then handed to tokio so that
//! bind failures surface before any worker task is spawned.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::error::{LcpError, Result};

/// Bind the shared UDP socket used for ECHO, MESSAGE, and FILE-header
/// traffic. `SO_REUSEADDR` lets a restarted peer rebind promptly;
/// `SO_BROADCAST` is required to send ECHO to a broadcast address.
pub fn bind_udp(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(LcpError::Io)?;
    socket.set_reuse_address(true).map_err(LcpError::Io)?;
    socket.set_broadcast(true).map_err(LcpError::Io)?;
    socket.set_nonblocking(true).map_err(LcpError::Io)?;
    socket
        .bind(&socket2::SockAddr::from(SocketAddr::V4(addr)))
        .map_err(LcpError::Io)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(LcpError::Io)
}

/// Bind the TCP listener used for FILE bodies.
pub async fn bind_tcp(port: u16) -> Result<TcpListener> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    TcpListener::bind(SocketAddr::V4(addr))
        .await
        .map_err(LcpError::Io)
}

/// Resolve a configured broadcast destination string to a `SocketAddr`,
/// pairing it with the well-known LCP port.
pub fn broadcast_target(address: &str, port: u16) -> Result<SocketAddr> {
    let ip: Ipv4Addr = address
        .parse()
        .map_err(|_| LcpError::Config(format!("invalid broadcast address: {address}")))?;
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_udp_picks_ephemeral_port() {
        let socket = bind_udp(0).expect("bind should succeed");
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn bind_tcp_picks_ephemeral_port() {
        let listener = bind_tcp(0).await.expect("bind should succeed");
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn broadcast_target_rejects_garbage() {
        assert!(broadcast_target("not-an-ip", 9990).is_err());
        assert!(broadcast_target("255.255.255.255", 9990).is_ok());
    }
}
