//! UDP socket construction
//!
//! All loops in this crate poll blocking sockets with a short read
//! timeout, so every socket is built here with the options it needs.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Options for [`create_socket`]
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub bind: SocketAddrV4,
    pub reuse_address: bool,
    pub broadcast: bool,
    pub read_timeout: Option<Duration>,
}

impl SocketOptions {
    /// Plain socket on `bind`, no reuse, no broadcast, blocking reads
    pub fn bind(bind: SocketAddrV4) -> Self {
        Self {
            bind,
            reuse_address: false,
            broadcast: false,
            read_timeout: None,
        }
    }

    /// Unbound sender that may address broadcast destinations
    pub fn broadcast_sender() -> Self {
        Self {
            broadcast: true,
            ..Self::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        }
    }

    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Create a configured, bound UDP socket
pub fn create_socket(options: SocketOptions) -> Result<UdpSocket, NetworkError> {
    let bind_failed = |e: std::io::Error| NetworkError::BindFailed {
        addr: options.bind.to_string(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_failed)?;

    if options.reuse_address {
        socket.set_reuse_address(true).map_err(bind_failed)?;
    }
    if options.broadcast {
        socket.set_broadcast(true).map_err(bind_failed)?;
    }
    if let Some(timeout) = options.read_timeout {
        socket.set_read_timeout(Some(timeout)).map_err(bind_failed)?;
    }

    socket
        .bind(&SocketAddr::V4(options.bind).into())
        .map_err(bind_failed)?;

    Ok(socket.into())
}

/// Bind an OS-assigned media port on `local_ip`
///
/// The socket is returned together with its port so the advertised port
/// and the socket that later carries the audio are the same.
pub fn bind_media_socket(local_ip: Ipv4Addr) -> Result<(UdpSocket, u16), NetworkError> {
    let socket = create_socket(SocketOptions::bind(SocketAddrV4::new(local_ip, 0)))?;
    let port = local_port(&socket)?;
    Ok((socket, port))
}

/// Port a bound socket ended up on
pub fn local_port(socket: &UdpSocket) -> Result<u16, NetworkError> {
    socket
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| NetworkError::BindFailed {
            addr: "local".to_string(),
            reason: e.to_string(),
        })
}

/// Whether an I/O error is just a read timeout expiring
pub fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_media_socket_gets_ephemeral_port() {
        let (socket, port) = bind_media_socket(Ipv4Addr::LOCALHOST).unwrap();
        assert_ne!(port, 0);
        assert_eq!(socket.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_read_timeout_applies() {
        let socket = create_socket(
            SocketOptions::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
                .read_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = create_socket(SocketOptions::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap();
        let taken = match first.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let second = create_socket(SocketOptions::bind(taken));
        assert!(matches!(second, Err(NetworkError::BindFailed { .. })));
    }
}
