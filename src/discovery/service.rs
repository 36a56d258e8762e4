//! Broadcast presence: beacon sender and beacon/goodbye listener
//!
//! Two threads per service:
//!
//! - `discovery-beacon` sends one BEACON per local interface to that
//!   interface's broadcast address every `beacon_interval`, and whenever
//!   [`DiscoveryService::trigger`] is called.
//! - `discovery-listen` receives BEACON/BYE datagrams on the broadcast
//!   port and maintains the [`PeerRegistry`].
//!
//! Both loops wake at least every [`RECV_TIMEOUT`] so a stop request is
//! observed promptly.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::constants::{
    DEFAULT_BEACON_INTERVAL, DEFAULT_BROADCAST_PORT, DEFAULT_CONTROL_PORT, DEFAULT_DISPLAY_NAME,
    DEFAULT_PEER_TTL, DEFAULT_PRUNE_AFTER, MAX_CONTROL_DATAGRAM, RECV_TIMEOUT,
};
use crate::discovery::registry::{Peer, PeerRegistry};
use crate::error::NetworkError;
use crate::network::interfaces::{shared_network, InterfaceLister};
use crate::network::udp::{create_socket, is_timeout, local_port, SocketOptions};
use crate::protocol::Message;
use crate::worker::{self, notify, ChangeCallback, JOIN_TIMEOUT};

/// Discovery settings for one service instance
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub self_id: String,
    pub display_name: String,
    pub username: Option<String>,
    /// Port beacons are sent to and received on
    pub broadcast_port: u16,
    /// Control port advertised in beacons; not bound here
    pub control_port: u16,
    pub beacon_interval: Duration,
    /// Local address the discovery sockets bind to
    pub bind_address: Ipv4Addr,
    /// Freshness window for [`DiscoveryService::peers`]
    pub peer_ttl: Duration,
    /// Silence after which a stored peer is deleted outright
    pub prune_after: Duration,
}

impl DiscoveryOptions {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            username: None,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            bind_address: Ipv4Addr::UNSPECIFIED,
            peer_ttl: DEFAULT_PEER_TTL,
            prune_after: DEFAULT_PRUNE_AFTER,
        }
    }
}

/// What we advertise about ourselves
struct Identity {
    id: String,
    display_name: String,
    username: RwLock<String>,
    control_port: u16,
}

impl Identity {
    fn beacon(&self, nets: Vec<String>) -> Message {
        Message::Beacon {
            id: self.id.clone(),
            name: self.display_name.clone(),
            username: Some(self.username.read().clone()),
            control_port: self.control_port,
            nets,
        }
    }
}

/// Sends beacons and goodbyes to every local broadcast address
struct Beaconer {
    socket: UdpSocket,
    identity: Arc<Identity>,
    interfaces: Arc<dyn InterfaceLister>,
    broadcast_port: u16,
}

impl Beaconer {
    /// One beacon cycle; returns the number of datagrams sent
    fn send_beacon(&self) -> Result<usize, NetworkError> {
        let interfaces = self.interfaces.interfaces()?;
        let nets = interfaces.iter().map(|iface| iface.cidr()).collect();
        let payload = self.identity.beacon(nets).encode()?;
        Ok(self.broadcast(&payload, interfaces.iter().map(|iface| iface.broadcast)))
    }

    fn send_goodbye(&self) -> Result<usize, NetworkError> {
        let interfaces = self.interfaces.interfaces()?;
        let payload = Message::Bye {
            id: self.identity.id.clone(),
        }
        .encode()?;
        Ok(self.broadcast(&payload, interfaces.iter().map(|iface| iface.broadcast)))
    }

    fn broadcast(&self, payload: &[u8], targets: impl Iterator<Item = Ipv4Addr>) -> usize {
        let mut sent = 0;
        for target in targets {
            let dest = SocketAddrV4::new(target, self.broadcast_port);
            match self.socket.send_to(payload, dest) {
                Ok(_) => sent += 1,
                Err(e) => tracing::debug!("Broadcast to {} failed: {}", dest, e),
            }
        }
        sent
    }
}

/// Turns received datagrams into registry updates
struct Listener {
    registry: Arc<PeerRegistry>,
    interfaces: Arc<dyn InterfaceLister>,
    on_change: Option<ChangeCallback>,
}

impl Listener {
    /// Handle one datagram; returns whether the registry was touched
    fn handle_datagram(&self, data: &[u8], from: Ipv4Addr) -> bool {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!("Ignoring datagram from {}: {}", from, e);
                return false;
            }
        };

        match message {
            Message::Beacon {
                id,
                name,
                username,
                control_port,
                nets,
            } => {
                if id == self.registry.self_id() {
                    return false;
                }

                if tracing::enabled!(tracing::Level::DEBUG) {
                    let shared = self
                        .interfaces
                        .interfaces()
                        .ok()
                        .and_then(|local| shared_network(&nets, &local));
                    tracing::debug!(
                        "Beacon from {} ({}) at {}, shared network {:?}",
                        id,
                        name,
                        from,
                        shared
                    );
                }

                self.registry
                    .upsert(&id, from, control_port, &name, username.as_deref());
                notify(self.on_change.as_ref());
                true
            }
            Message::Bye { id } => {
                if id == self.registry.self_id() {
                    return false;
                }
                if self.registry.remove(&id) {
                    tracing::info!("Peer {} said goodbye", id);
                }
                notify(self.on_change.as_ref());
                true
            }
            other => {
                tracing::debug!("Ignoring {} on discovery port from {}", other.kind(), from);
                false
            }
        }
    }
}

/// LAN presence service
pub struct DiscoveryService {
    options: DiscoveryOptions,
    identity: Arc<Identity>,
    registry: Arc<PeerRegistry>,
    interfaces: Arc<dyn InterfaceLister>,
    on_change: Option<ChangeCallback>,
    running: Arc<AtomicBool>,
    trigger_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    listen_port: Mutex<Option<u16>>,
}

impl DiscoveryService {
    pub fn new(options: DiscoveryOptions, interfaces: Arc<dyn InterfaceLister>) -> Self {
        let identity = Arc::new(Identity {
            id: options.self_id.clone(),
            display_name: options.display_name.clone(),
            username: RwLock::new(
                options
                    .username
                    .clone()
                    .unwrap_or_else(|| options.display_name.clone()),
            ),
            control_port: options.control_port,
        });

        Self {
            registry: Arc::new(PeerRegistry::new(options.self_id.clone())),
            identity,
            options,
            interfaces,
            on_change: None,
            running: Arc::new(AtomicBool::new(false)),
            trigger_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            listen_port: Mutex::new(None),
        }
    }

    /// Call `callback` whenever the peer set may have changed
    pub fn with_change_callback(mut self, callback: ChangeCallback) -> Self {
        self.on_change = Some(callback);
        self
    }

    /// Bind the discovery sockets and start both loops
    pub fn start(&self) -> Result<(), NetworkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (listen_socket, beacon_socket, port) = match self.bind_sockets() {
            Ok(bound) => bound,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.listen_port.lock() = Some(port);

        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        *self.trigger_tx.lock() = Some(trigger_tx);

        let beaconer = Beaconer {
            socket: beacon_socket,
            identity: self.identity.clone(),
            interfaces: self.interfaces.clone(),
            broadcast_port: self.options.broadcast_port,
        };
        let listener = Listener {
            registry: self.registry.clone(),
            interfaces: self.interfaces.clone(),
            on_change: self.on_change.clone(),
        };

        let running = self.running.clone();
        let interval = self.options.beacon_interval;
        let beacon = worker::spawn("discovery-beacon", move || {
            beacon_loop(beaconer, trigger_rx, interval, running)
        });

        let running = self.running.clone();
        let prune_after = self.options.prune_after.max(self.options.peer_ttl);
        let listen = worker::spawn("discovery-listen", move || {
            listen_loop(listener, listen_socket, prune_after, running)
        });

        match (beacon, listen) {
            (Ok(beacon), Ok(listen)) => self.threads.lock().extend([beacon, listen]),
            (beacon, listen) => {
                let reason = match (&beacon, &listen) {
                    (Err(e), _) | (_, Err(e)) => e.to_string(),
                    _ => String::new(),
                };
                self.threads.lock().extend(beacon.into_iter().chain(listen));
                self.stop();
                return Err(NetworkError::BindFailed {
                    addr: format!("discovery threads on port {}", port),
                    reason,
                });
            }
        }

        tracing::info!(
            "Discovery started on port {} as {} ({})",
            port,
            self.identity.id,
            self.identity.username.read()
        );
        Ok(())
    }

    fn bind_sockets(&self) -> Result<(UdpSocket, UdpSocket, u16), NetworkError> {
        let listen = create_socket(
            SocketOptions::bind(SocketAddrV4::new(
                self.options.bind_address,
                self.options.broadcast_port,
            ))
            .reuse_address(true)
            .broadcast(true)
            .read_timeout(RECV_TIMEOUT),
        )?;
        let beacon = create_socket(
            SocketOptions::bind(SocketAddrV4::new(self.options.bind_address, 0)).broadcast(true),
        )?;
        let port = local_port(&listen)?;
        Ok((listen, beacon, port))
    }

    /// Stop both loops, waiting a bounded time for each
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender wakes the beacon loop immediately
        self.trigger_tx.lock().take();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            worker::join_bounded(handle, JOIN_TIMEOUT);
        }
        tracing::info!("Discovery stopped");
    }

    /// Send an extra beacon now
    pub fn trigger(&self) {
        if let Some(tx) = self.trigger_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Broadcast a BYE on every local interface
    ///
    /// Meant to be called once at shutdown. Returns the number of
    /// datagrams sent.
    pub fn send_goodbye(&self) -> Result<usize, NetworkError> {
        let socket = create_socket(
            SocketOptions::bind(SocketAddrV4::new(self.options.bind_address, 0)).broadcast(true),
        )?;
        let beaconer = Beaconer {
            socket,
            identity: self.identity.clone(),
            interfaces: self.interfaces.clone(),
            broadcast_port: self.options.broadcast_port,
        };
        let sent = beaconer.send_goodbye()?;
        tracing::info!("Sent goodbye on {} interface(s)", sent);
        Ok(sent)
    }

    /// Peers seen within the configured TTL
    pub fn peers(&self) -> Vec<Peer> {
        self.registry.list_active(self.options.peer_ttl)
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn self_id(&self) -> &str {
        &self.identity.id
    }

    pub fn username(&self) -> String {
        self.identity.username.read().clone()
    }

    /// Change the advertised username; takes effect on the next beacon
    pub fn set_username(&self, username: impl Into<String>) {
        *self.identity.username.write() = username.into();
        self.trigger();
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Port the listener is bound to, once started
    pub fn listen_port(&self) -> Option<u16> {
        *self.listen_port.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn beacon_loop(
    beaconer: Beaconer,
    trigger_rx: Receiver<()>,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match beaconer.send_beacon() {
            Ok(sent) => tracing::trace!("Beacon sent on {} interface(s)", sent),
            Err(e) => tracing::warn!("Beacon cycle failed: {}", e),
        }

        match trigger_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn listen_loop(
    listener: Listener,
    socket: UdpSocket,
    prune_after: Duration,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_CONTROL_DATAGRAM];
    let mut last_prune = Instant::now();

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, SocketAddr::V4(from))) => {
                listener.handle_datagram(&buf[..len], *from.ip());
            }
            Ok((_, SocketAddr::V6(_))) => {}
            Err(e) if is_timeout(&e) => {}
            Err(e) => tracing::debug!("Discovery receive failed: {}", e),
        }

        if last_prune.elapsed() >= prune_after {
            let pruned = listener.registry.prune(prune_after);
            if pruned > 0 {
                tracing::debug!("Pruned {} long-silent peer(s)", pruned);
            }
            last_prune = Instant::now();
        }
    }
}
