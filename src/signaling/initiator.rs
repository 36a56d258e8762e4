//! Caller side of call signaling
//!
//! Binds a media port, then sends OFFER to the peer's control port about
//! once per [`OFFER_RESEND_INTERVAL`] until the peer answers RINGING.
//! After RINGING the caller only waits for ACCEPT or REJECT. The overall
//! deadline bounds the whole exchange; a lost reply surfaces as a timeout.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{DEFAULT_CALL_TIMEOUT, MAX_CONTROL_DATAGRAM, OFFER_RESEND_INTERVAL};
use crate::error::{NetworkError, Result};
use crate::network::interfaces::{select_local_ip_with, InterfaceLister};
use crate::network::udp::{bind_media_socket, create_socket, is_timeout, SocketOptions};
use crate::protocol::Message;

/// Result of a successful handshake
#[derive(Debug)]
pub struct OutgoingCall {
    pub local_media_port: u16,
    pub local_ip: Ipv4Addr,
    pub remote_media_port: u16,
    pub remote_ip: Ipv4Addr,
    /// Socket bound to `local_ip:local_media_port`
    pub media_socket: UdpSocket,
}

/// Places outgoing calls
#[derive(Clone)]
pub struct CallInitiator {
    interfaces: Arc<dyn InterfaceLister>,
    timeout: Duration,
    resend_interval: Duration,
}

impl CallInitiator {
    pub fn new(interfaces: Arc<dyn InterfaceLister>) -> Self {
        Self {
            interfaces,
            timeout: DEFAULT_CALL_TIMEOUT,
            resend_interval: OFFER_RESEND_INTERVAL,
        }
    }

    /// Overall handshake deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the handshake against `peer_ip:peer_control_port`
    ///
    /// Blocks until ACCEPT, REJECT or the deadline.
    pub fn call(&self, peer_ip: Ipv4Addr, peer_control_port: u16) -> Result<OutgoingCall> {
        check_peer(peer_ip, peer_control_port)?;
        let local_ip = select_local_ip_with(peer_ip, self.interfaces.as_ref());
        let (media_socket, local_media_port) = bind_media_socket(local_ip)?;
        let control = create_socket(
            SocketOptions::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
                .read_timeout(self.resend_interval),
        )?;

        let peer = SocketAddrV4::new(peer_ip, peer_control_port);
        let offer = Message::Offer {
            caller_media_port: local_media_port,
        }
        .encode()?;

        tracing::info!(
            "Calling {} from {}:{}",
            peer,
            local_ip,
            local_media_port
        );

        let deadline = Instant::now() + self.timeout;
        let mut ringing = false;
        let mut last_offer: Option<Instant> = None;
        let mut buf = [0u8; MAX_CONTROL_DATAGRAM];

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!("No answer from {} within {:?}", peer, self.timeout);
                return Err(NetworkError::HandshakeTimeout(self.timeout).into());
            }

            if !ringing && last_offer.map_or(true, |sent| now.duration_since(sent) >= self.resend_interval) {
                if let Err(e) = control.send_to(&offer, peer) {
                    tracing::debug!("OFFER to {} failed: {}", peer, e);
                }
                last_offer = Some(now);
            }

            // Wake for the next resend, the deadline, or a reply, whichever is first
            let mut wait = deadline - now;
            if let (false, Some(sent)) = (ringing, last_offer) {
                wait = wait.min((sent + self.resend_interval).saturating_duration_since(now));
            }
            wait = wait.min(self.resend_interval).max(Duration::from_millis(1));
            if let Err(e) = control.set_read_timeout(Some(wait)) {
                tracing::debug!("Failed to set read timeout: {}", e);
            }

            let len = match control.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    tracing::debug!("Control receive failed: {}", e);
                    std::thread::sleep(Duration::from_millis(20));
                    continue;
                }
            };

            match Message::decode(&buf[..len]) {
                Ok(Message::Ringing) => {
                    if !ringing {
                        tracing::info!("{} is ringing", peer);
                    }
                    ringing = true;
                }
                Ok(Message::Accept { callee_media_port }) => {
                    tracing::info!("{} accepted, media port {}", peer, callee_media_port);
                    return Ok(OutgoingCall {
                        local_media_port,
                        local_ip,
                        remote_media_port: callee_media_port,
                        remote_ip: peer_ip,
                        media_socket,
                    });
                }
                Ok(Message::Reject) => {
                    tracing::info!("{} rejected the call", peer);
                    return Err(NetworkError::Rejected.into());
                }
                Ok(other) => tracing::debug!("Ignoring {} during handshake", other.kind()),
                Err(e) => tracing::trace!("Ignoring malformed reply: {}", e),
            }
        }
    }
}

/// A call needs one reachable unicast peer
fn check_peer(peer_ip: Ipv4Addr, peer_control_port: u16) -> std::result::Result<(), NetworkError> {
    if peer_ip.is_unspecified() || peer_ip.is_broadcast() || peer_ip.is_multicast() || peer_control_port == 0 {
        return Err(NetworkError::InvalidAddress(format!(
            "{}:{}",
            peer_ip, peer_control_port
        )));
    }
    Ok(())
}

/// One-shot handshake with the default resend cadence
pub fn initiate_call(
    peer_ip: Ipv4Addr,
    peer_control_port: u16,
    timeout: Duration,
    interfaces: Arc<dyn InterfaceLister>,
) -> Result<OutgoingCall> {
    CallInitiator::new(interfaces)
        .with_timeout(timeout)
        .call(peer_ip, peer_control_port)
}
