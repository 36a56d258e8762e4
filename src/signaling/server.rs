//! Responder side of call signaling
//!
//! ```text
//!            OFFER                accept_pending()
//!   Idle ───────────────▶ Offered ─────────────────▶ Idle   (ACCEPT sent)
//!                            │     reject_pending()
//!                            └───────────────────────▶ Idle   (REJECT sent)
//! ```
//!
//! RINGING is sent while the pending slot is locked, so it always reaches
//! the caller before any ACCEPT or REJECT for the same offer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::constants::{DEFAULT_CONTROL_PORT, MAX_CONTROL_DATAGRAM, RECV_TIMEOUT};
use crate::error::{CallError, NetworkError, Result};
use crate::network::interfaces::{select_local_ip_with, InterfaceLister};
use crate::network::udp::{bind_media_socket, create_socket, is_timeout, local_port, SocketOptions};
use crate::protocol::Message;
use crate::worker::{self, notify, ChangeCallback, JOIN_TIMEOUT};

/// An incoming call awaiting accept or reject
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOffer {
    pub peer_ip: Ipv4Addr,
    /// Address the OFFER came from; replies go here
    pub peer_reply_address: SocketAddrV4,
    pub peer_media_port: u16,
    /// Our address on the network shared with the caller
    pub local_ip: Ipv4Addr,
    pub received_at: DateTime<Utc>,
}

/// Result of accepting the pending offer
#[derive(Debug)]
pub struct AcceptedCall {
    pub peer_ip: Ipv4Addr,
    pub peer_media_port: u16,
    pub my_media_port: u16,
    pub local_ip: Ipv4Addr,
    /// Socket bound to `local_ip:my_media_port`
    pub media_socket: UdpSocket,
}

/// Control listener settings
#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub port: u16,
    pub bind_address: Ipv4Addr,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONTROL_PORT,
            bind_address: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// State shared between the listener thread and accept/reject callers
struct Responder {
    pending: Mutex<Option<PendingOffer>>,
    interfaces: Arc<dyn InterfaceLister>,
    on_change: Option<ChangeCallback>,
}

impl Responder {
    fn handle_datagram(&self, data: &[u8], from: SocketAddrV4, socket: &UdpSocket) {
        let caller_media_port = match Message::decode(data) {
            Ok(Message::Offer { caller_media_port }) => caller_media_port,
            Ok(other) => {
                tracing::debug!("Ignoring {} on control port from {}", other.kind(), from);
                return;
            }
            Err(e) => {
                tracing::trace!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };

        let local_ip = select_local_ip_with(*from.ip(), self.interfaces.as_ref());
        let offer = PendingOffer {
            peer_ip: *from.ip(),
            peer_reply_address: from,
            peer_media_port: caller_media_port,
            local_ip,
            received_at: Utc::now(),
        };

        let displaced = {
            let mut pending = self.pending.lock();
            send_message(socket, &Message::Ringing, from);
            pending.replace(offer)
        };

        match displaced {
            Some(old) if old.peer_reply_address != from => {
                tracing::info!(
                    "Offer from {} replaced by offer from {}, rejecting the former",
                    old.peer_reply_address,
                    from
                );
                send_message(socket, &Message::Reject, old.peer_reply_address);
            }
            Some(_) => tracing::debug!("Repeated offer from {}", from),
            None => tracing::info!("Incoming call from {} (media port {})", from, caller_media_port),
        }

        notify(self.on_change.as_ref());
    }
}

fn send_message(socket: &UdpSocket, message: &Message, to: SocketAddrV4) -> bool {
    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!("Failed to encode {}: {}", message.kind(), e);
            return false;
        }
    };
    match socket.send_to(&payload, to) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Failed to send {} to {}: {}", message.kind(), to, e);
            false
        }
    }
}

/// UDP signaling responder holding at most one pending offer
pub struct ControlServer {
    options: ControlOptions,
    responder: Arc<Responder>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    reply_socket: Mutex<Option<UdpSocket>>,
    local_port: Mutex<Option<u16>>,
}

impl ControlServer {
    pub fn new(options: ControlOptions, interfaces: Arc<dyn InterfaceLister>) -> Self {
        Self::build(options, interfaces, None)
    }

    /// Like [`new`](Self::new), calling `callback` whenever the pending slot changes
    pub fn with_change_callback(
        options: ControlOptions,
        interfaces: Arc<dyn InterfaceLister>,
        callback: ChangeCallback,
    ) -> Self {
        Self::build(options, interfaces, Some(callback))
    }

    fn build(
        options: ControlOptions,
        interfaces: Arc<dyn InterfaceLister>,
        on_change: Option<ChangeCallback>,
    ) -> Self {
        Self {
            options,
            responder: Arc::new(Responder {
                pending: Mutex::new(None),
                interfaces,
                on_change,
            }),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            reply_socket: Mutex::new(None),
            local_port: Mutex::new(None),
        }
    }

    /// Bind the control port and start the listener thread
    pub fn start(&self) -> std::result::Result<(), NetworkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bound = create_socket(
            SocketOptions::bind(SocketAddrV4::new(self.options.bind_address, self.options.port))
                .reuse_address(true)
                .read_timeout(RECV_TIMEOUT),
        )
        .and_then(|socket| {
            let port = local_port(&socket)?;
            let reply = socket.try_clone().map_err(|e| NetworkError::BindFailed {
                addr: format!("control port {}", port),
                reason: e.to_string(),
            })?;
            Ok((socket, reply, port))
        });

        let (socket, reply, port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let responder = self.responder.clone();
        let running = self.running.clone();
        let handle = worker::spawn("control-listen", move || serve(responder, socket, running))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::BindFailed {
                    addr: format!("control port {}", port),
                    reason: e.to_string(),
                }
            })?;

        *self.thread.lock() = Some(handle);
        *self.reply_socket.lock() = Some(reply);
        *self.local_port.lock() = Some(port);
        tracing::info!("Control server listening on port {}", port);
        Ok(())
    }

    /// Stop the listener, waiting a bounded time for it
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            worker::join_bounded(handle, JOIN_TIMEOUT);
        }
        self.reply_socket.lock().take();
        tracing::info!("Control server stopped");
    }

    /// Snapshot of the pending offer
    pub fn pending(&self) -> Option<PendingOffer> {
        self.responder.pending.lock().clone()
    }

    /// Accept the pending offer
    ///
    /// Binds a media port on the offer's local address, answers ACCEPT and
    /// hands back the parameters and socket for the audio session. Fails
    /// with [`CallError::NoPendingOffer`] and sends nothing when the slot
    /// is empty. If no media port can be bound, or the ACCEPT cannot be
    /// sent, the offer stays pending.
    pub fn accept_pending(&self) -> Result<AcceptedCall> {
        let accepted = {
            let mut pending = self.responder.pending.lock();
            let offer = pending.take().ok_or(CallError::NoPendingOffer)?;

            let (media_socket, my_media_port) = match bind_media_socket(offer.local_ip) {
                Ok(bound) => bound,
                Err(e) => {
                    *pending = Some(offer);
                    return Err(e.into());
                }
            };

            let reply = Message::Accept {
                callee_media_port: my_media_port,
            };
            if let Err(e) = self.reply(&reply, offer.peer_reply_address) {
                *pending = Some(offer);
                return Err(e.into());
            }

            AcceptedCall {
                peer_ip: offer.peer_ip,
                peer_media_port: offer.peer_media_port,
                my_media_port,
                local_ip: offer.local_ip,
                media_socket,
            }
        };

        tracing::info!(
            "Accepted call from {}:{} on {}:{}",
            accepted.peer_ip,
            accepted.peer_media_port,
            accepted.local_ip,
            accepted.my_media_port
        );
        notify(self.responder.on_change.as_ref());
        Ok(accepted)
    }

    /// Reject the pending offer
    ///
    /// Fails with [`CallError::NoPendingOffer`] and sends nothing when the
    /// slot is empty.
    pub fn reject_pending(&self) -> Result<()> {
        let offer = {
            let mut pending = self.responder.pending.lock();
            let offer = pending.take().ok_or(CallError::NoPendingOffer)?;
            self.reply(&Message::Reject, offer.peer_reply_address)?;
            offer
        };

        tracing::info!("Rejected call from {}", offer.peer_reply_address);
        notify(self.responder.on_change.as_ref());
        Ok(())
    }

    fn reply(&self, message: &Message, to: SocketAddrV4) -> std::result::Result<(), NetworkError> {
        let payload = message.encode()?;
        let sent = match self.reply_socket.lock().as_ref() {
            Some(socket) => socket.send_to(&payload, to),
            None => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|s| s.send_to(&payload, to)),
        };
        sent.map(|_| ())
            .map_err(|e| NetworkError::SendFailed(format!("{} to {}: {}", message.kind(), to, e)))
    }

    /// Port the listener is bound to, once started
    pub fn local_port(&self) -> Option<u16> {
        *self.local_port.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(responder: Arc<Responder>, socket: UdpSocket, running: Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_CONTROL_DATAGRAM];

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, SocketAddr::V4(from))) => responder.handle_datagram(&buf[..len], from, &socket),
            Ok((_, SocketAddr::V6(_))) => {}
            Err(e) if is_timeout(&e) => {}
            Err(e) => tracing::debug!("Control receive failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::network::interfaces::{NetworkInterface, StaticInterfaces};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn loopback() -> Arc<dyn InterfaceLister> {
        Arc::new(StaticInterfaces(vec![NetworkInterface::new(
            "lo",
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(255, 0, 0, 0),
        )
        .unwrap()]))
    }

    fn server_with_counter() -> (ControlServer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = ControlServer::with_change_callback(
            ControlOptions {
                port: 0,
                bind_address: Ipv4Addr::LOCALHOST,
            },
            loopback(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        server.start().unwrap();
        (server, calls)
    }

    fn caller() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn offer(socket: &UdpSocket, server: &ControlServer, media_port: u16) {
        let payload = Message::Offer {
            caller_media_port: media_port,
        }
        .encode()
        .unwrap();
        socket
            .send_to(&payload, ("127.0.0.1", server.local_port().unwrap()))
            .unwrap();
    }

    fn recv(socket: &UdpSocket) -> Message {
        let mut buf = [0u8; MAX_CONTROL_DATAGRAM];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        Message::decode(&buf[..len]).unwrap()
    }

    fn wait_pending(server: &ControlServer, from: SocketAddr) -> PendingOffer {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(pending) = server.pending() {
                if SocketAddr::V4(pending.peer_reply_address) == from {
                    return pending;
                }
            }
            assert!(Instant::now() < deadline, "offer never became pending");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_no_pending_offer_fails_both_ways() {
        let (server, calls) = server_with_counter();
        assert!(matches!(
            server.accept_pending(),
            Err(Error::Call(CallError::NoPendingOffer))
        ));
        assert!(matches!(
            server.reject_pending(),
            Err(Error::Call(CallError::NoPendingOffer))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_offer_rings_then_accept() {
        let (server, calls) = server_with_counter();
        let socket = caller();
        offer(&socket, &server, 50_000);

        assert_eq!(recv(&socket), Message::Ringing);
        let pending = wait_pending(&server, socket.local_addr().unwrap());
        assert_eq!(pending.peer_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(pending.peer_media_port, 50_000);
        assert_eq!(pending.local_ip, Ipv4Addr::LOCALHOST);

        let accepted = server.accept_pending().unwrap();
        assert_eq!(accepted.peer_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(accepted.peer_media_port, 50_000);
        assert_eq!(accepted.local_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(
            accepted.media_socket.local_addr().unwrap().port(),
            accepted.my_media_port
        );
        assert_eq!(
            recv(&socket),
            Message::Accept {
                callee_media_port: accepted.my_media_port
            }
        );

        // Slot is empty now
        assert!(server.pending().is_none());
        assert!(matches!(
            server.accept_pending(),
            Err(Error::Call(CallError::NoPendingOffer))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_accept_send_keeps_offer() {
        let (server, calls) = server_with_counter();
        // Broadcast is not enabled on the reply socket, so this send fails
        let unreachable = SocketAddrV4::new(Ipv4Addr::BROADCAST, 9);
        *server.responder.pending.lock() = Some(PendingOffer {
            peer_ip: Ipv4Addr::LOCALHOST,
            peer_reply_address: unreachable,
            peer_media_port: 50_010,
            local_ip: Ipv4Addr::LOCALHOST,
            received_at: Utc::now(),
        });

        assert!(matches!(
            server.accept_pending(),
            Err(Error::Network(NetworkError::SendFailed(_)))
        ));
        let pending = server.pending().unwrap();
        assert_eq!(pending.peer_reply_address, unreachable);
        assert_eq!(pending.peer_media_port, 50_010);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_offer_rings_then_reject() {
        let (server, _) = server_with_counter();
        let socket = caller();
        offer(&socket, &server, 50_001);

        assert_eq!(recv(&socket), Message::Ringing);
        wait_pending(&server, socket.local_addr().unwrap());
        server.reject_pending().unwrap();
        assert_eq!(recv(&socket), Message::Reject);
        assert!(server.pending().is_none());
    }

    #[test]
    fn test_repeated_offer_replaces_silently() {
        let (server, _) = server_with_counter();
        let socket = caller();
        offer(&socket, &server, 50_002);
        offer(&socket, &server, 50_002);

        assert_eq!(recv(&socket), Message::Ringing);
        assert_eq!(recv(&socket), Message::Ringing);

        socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; MAX_CONTROL_DATAGRAM];
        assert!(socket.recv_from(&mut buf).is_err());
        assert!(server.pending().is_some());
    }

    #[test]
    fn test_new_caller_displaces_pending_offer() {
        let (server, _) = server_with_counter();
        let first = caller();
        let second = caller();

        offer(&first, &server, 50_003);
        assert_eq!(recv(&first), Message::Ringing);
        offer(&second, &server, 50_004);
        assert_eq!(recv(&second), Message::Ringing);

        assert_eq!(recv(&first), Message::Reject);
        let pending = wait_pending(&server, second.local_addr().unwrap());
        assert_eq!(pending.peer_media_port, 50_004);
    }

    #[test]
    fn test_non_offer_datagrams_ignored() {
        let (server, calls) = server_with_counter();
        let socket = caller();
        let port = server.local_port().unwrap();
        socket.send_to(b"junk", ("127.0.0.1", port)).unwrap();
        socket.send_to(br#"{"type":"OFFER"}"#, ("127.0.0.1", port)).unwrap();
        socket.send_to(br#"{"type":"ACCEPT","callee_media_port":1}"#, ("127.0.0.1", port)).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(server.pending().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_is_bounded() {
        let (server, _) = server_with_counter();
        let started = Instant::now();
        server.stop();
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(!server.is_running());
    }
}
