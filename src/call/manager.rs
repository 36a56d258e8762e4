//! The single owner of the call slot
//!
//! ```text
//!          start_call()           handshake ok                 devices open
//!   Idle ───────────────▶ Dialing ────────────▶ Connecting ──────────────▶ Active ──hangup()──▶ Idle
//!    │                       └── failure ──▶ Idle  ▲   └── failure ──▶ Idle
//!    └──────────── accept() (pending offer) ───────┘
//! ```
//!
//! The pending offer itself lives in the [`ControlServer`]; the manager
//! only consults it. Every transition is checked under one lock, so two
//! sessions can never exist at once. Devices are opened outside the lock
//! while the slot reads `Connecting`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;

use crate::audio::{AudioSession, DeviceSelection, MemorySource, NullSink, SessionStats, Volumes};
use crate::audio::frame::clamp_volume;
use crate::error::{CallError, Result};
use crate::signaling::{CallInitiator, ControlServer, PendingOffer};

/// Builds the media session once a handshake has completed
pub trait SessionFactory: Send + Sync {
    fn open(
        &self,
        socket: UdpSocket,
        remote: SocketAddrV4,
        devices: &DeviceSelection,
        volumes: Volumes,
    ) -> Result<AudioSession>;
}

/// Opens the selected cpal devices
pub struct DeviceSessionFactory;

impl SessionFactory for DeviceSessionFactory {
    fn open(
        &self,
        socket: UdpSocket,
        remote: SocketAddrV4,
        devices: &DeviceSelection,
        volumes: Volumes,
    ) -> Result<AudioSession> {
        AudioSession::open_devices(socket, remote, devices, volumes)
    }
}

/// Runs sessions on in-memory devices: nothing is captured, received frames are dropped
pub struct MemorySessionFactory;

impl SessionFactory for MemorySessionFactory {
    fn open(
        &self,
        socket: UdpSocket,
        remote: SocketAddrV4,
        _devices: &DeviceSelection,
        volumes: Volumes,
    ) -> Result<AudioSession> {
        AudioSession::start(
            socket,
            remote,
            Box::new(MemorySource::silent()),
            Box::new(NullSink::default()),
            volumes,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Snapshot of the active call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallInfo {
    pub direction: CallDirection,
    pub peer_ip: Ipv4Addr,
    pub peer_media_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_media_port: u16,
    pub started_at: DateTime<Utc>,
    pub volumes: Volumes,
    pub stats: SessionStats,
}

/// What the control surface sees
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallStatus {
    NoCall,
    PendingCall { offer: PendingOffer },
    Dialing { peer_ip: Ipv4Addr },
    /// Handshake done, audio devices opening
    Connecting {
        peer_ip: Ipv4Addr,
        direction: CallDirection,
    },
    ActiveCall { call: CallInfo },
}

struct ActiveCall {
    direction: CallDirection,
    peer: SocketAddrV4,
    local: SocketAddrV4,
    started_at: DateTime<Utc>,
    session: AudioSession,
}

impl ActiveCall {
    fn info(&self) -> CallInfo {
        CallInfo {
            direction: self.direction,
            peer_ip: *self.peer.ip(),
            peer_media_port: self.peer.port(),
            local_ip: *self.local.ip(),
            local_media_port: self.local.port(),
            started_at: self.started_at,
            volumes: self.session.volumes(),
            stats: self.session.stats(),
        }
    }
}

enum CallState {
    Idle,
    Dialing(Ipv4Addr),
    Connecting(CallDirection, SocketAddrV4),
    Active(ActiveCall),
}

/// Composes signaling and media so that at most one call exists
pub struct CallManager {
    control: Arc<ControlServer>,
    initiator: CallInitiator,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<CallState>,
    devices: RwLock<DeviceSelection>,
    volumes: Mutex<Volumes>,
}

impl CallManager {
    pub fn new(
        control: Arc<ControlServer>,
        initiator: CallInitiator,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            control,
            initiator,
            factory,
            state: Mutex::new(CallState::Idle),
            devices: RwLock::new(DeviceSelection::default()),
            volumes: Mutex::new(Volumes::default()),
        }
    }

    /// Devices and gains for the first session
    pub fn with_audio(self, devices: DeviceSelection, volumes: Volumes) -> Self {
        *self.devices.write() = devices;
        *self.volumes.lock() = volumes;
        self
    }

    /// Place a call and start the session once the peer accepts
    ///
    /// Blocks for the whole handshake. The slot reads `Dialing` meanwhile,
    /// so a concurrent start or accept is refused.
    pub fn start_call(&self, peer_ip: Ipv4Addr, control_port: u16) -> Result<CallInfo> {
        {
            let mut state = self.state.lock();
            match *state {
                CallState::Active(_) | CallState::Connecting(..) => {
                    return Err(CallError::AlreadyInCall.into())
                }
                CallState::Dialing(_) => return Err(CallError::Dialing.into()),
                CallState::Idle => {}
            }
            if self.control.pending().is_some() {
                return Err(CallError::OfferPending.into());
            }
            *state = CallState::Dialing(peer_ip);
        }

        let outgoing = match self.initiator.call(peer_ip, control_port) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                *self.state.lock() = CallState::Idle;
                return Err(e);
            }
        };

        let peer = SocketAddrV4::new(outgoing.remote_ip, outgoing.remote_media_port);
        let local = SocketAddrV4::new(outgoing.local_ip, outgoing.local_media_port);
        *self.state.lock() = CallState::Connecting(CallDirection::Outgoing, peer);
        self.connect(CallDirection::Outgoing, outgoing.media_socket, peer, local)
    }

    /// Accept the pending offer and start the session
    pub fn accept(&self) -> Result<CallInfo> {
        let accepted = {
            let mut state = self.state.lock();
            match *state {
                CallState::Active(_) | CallState::Connecting(..) => {
                    return Err(CallError::AlreadyInCall.into())
                }
                CallState::Dialing(_) => return Err(CallError::Dialing.into()),
                CallState::Idle => {}
            }

            let accepted = self.control.accept_pending()?;
            let peer = SocketAddrV4::new(accepted.peer_ip, accepted.peer_media_port);
            *state = CallState::Connecting(CallDirection::Incoming, peer);
            accepted
        };

        let peer = SocketAddrV4::new(accepted.peer_ip, accepted.peer_media_port);
        let local = SocketAddrV4::new(accepted.local_ip, accepted.my_media_port);
        self.connect(CallDirection::Incoming, accepted.media_socket, peer, local)
    }

    /// Reject the pending offer
    pub fn reject(&self) -> Result<()> {
        self.control.reject_pending()
    }

    /// End the active call; returns whether there was one
    ///
    /// An outgoing handshake or a session still opening is not interrupted.
    pub fn hangup(&self) -> bool {
        let call = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, CallState::Idle) {
                CallState::Active(call) => call,
                other => {
                    *state = other;
                    return false;
                }
            }
        };

        let mut session = call.session;
        session.stop();
        tracing::info!("Call with {} ended", call.peer);
        true
    }

    /// Current gains; those of the active session when there is one
    pub fn volume(&self) -> Volumes {
        match &*self.state.lock() {
            CallState::Active(call) => call.session.volumes(),
            _ => *self.volumes.lock(),
        }
    }

    /// Update either gain, clamped to 0..=100
    ///
    /// Applies to the active session immediately and to every later one.
    pub fn set_volume(&self, input: Option<i64>, output: Option<i64>) -> Volumes {
        let volumes = {
            let mut volumes = self.volumes.lock();
            if let Some(input) = input {
                volumes.input = clamp_volume(input);
            }
            if let Some(output) = output {
                volumes.output = clamp_volume(output);
            }
            *volumes
        };

        if let CallState::Active(call) = &*self.state.lock() {
            call.session.set_input_volume(volumes.input.into());
            call.session.set_output_volume(volumes.output.into());
        }
        volumes
    }

    /// Devices used by the next session
    pub fn set_devices(&self, devices: DeviceSelection) {
        *self.devices.write() = devices;
    }

    pub fn devices(&self) -> DeviceSelection {
        self.devices.read().clone()
    }

    pub fn status(&self) -> CallStatus {
        match &*self.state.lock() {
            CallState::Active(call) => CallStatus::ActiveCall { call: call.info() },
            CallState::Dialing(peer_ip) => CallStatus::Dialing { peer_ip: *peer_ip },
            CallState::Connecting(direction, peer) => CallStatus::Connecting {
                peer_ip: *peer.ip(),
                direction: *direction,
            },
            CallState::Idle => match self.control.pending() {
                Some(offer) => CallStatus::PendingCall { offer },
                None => CallStatus::NoCall,
            },
        }
    }

    pub fn in_call(&self) -> bool {
        matches!(*self.state.lock(), CallState::Active(_))
    }

    pub fn control(&self) -> &Arc<ControlServer> {
        &self.control
    }

    /// Hang up before the process exits
    pub fn shutdown(&self) {
        if self.hangup() {
            tracing::info!("Active call ended for shutdown");
        }
    }

    /// Open the session with the slot unlocked, then publish it
    fn connect(
        &self,
        direction: CallDirection,
        socket: UdpSocket,
        peer: SocketAddrV4,
        local: SocketAddrV4,
    ) -> Result<CallInfo> {
        let devices = self.devices.read().clone();
        let volumes = *self.volumes.lock();
        let session = match self.factory.open(socket, peer, &devices, volumes) {
            Ok(session) => session,
            Err(e) => {
                *self.state.lock() = CallState::Idle;
                tracing::warn!("Call with {} answered but audio failed: {}", peer, e);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        // Volume changes made while the devices were opening
        let volumes = *self.volumes.lock();
        session.set_input_volume(volumes.input.into());
        session.set_output_volume(volumes.output.into());

        let call = ActiveCall {
            direction,
            peer,
            local,
            started_at: Utc::now(),
            session,
        };
        let info = call.info();
        *state = CallState::Active(call);
        tracing::info!("Call with {} started", peer);
        Ok(info)
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AudioError, Error, NetworkError};
    use crate::network::interfaces::{InterfaceLister, NetworkInterface, StaticInterfaces};
    use crate::protocol::Message;
    use crate::signaling::ControlOptions;
    use std::time::Duration;

    struct FailingFactory;

    impl SessionFactory for FailingFactory {
        fn open(&self, _: UdpSocket, _: SocketAddrV4, _: &DeviceSelection, _: Volumes) -> Result<AudioSession> {
            Err(AudioError::DeviceNotFound("test".into()).into())
        }
    }

    /// In-memory sessions that take `delay` to open
    struct SlowFactory {
        delay: Duration,
    }

    impl SessionFactory for SlowFactory {
        fn open(
            &self,
            socket: UdpSocket,
            remote: SocketAddrV4,
            devices: &DeviceSelection,
            volumes: Volumes,
        ) -> Result<AudioSession> {
            std::thread::sleep(self.delay);
            MemorySessionFactory.open(socket, remote, devices, volumes)
        }
    }

    fn loopback() -> Arc<dyn InterfaceLister> {
        Arc::new(StaticInterfaces(vec![NetworkInterface::new(
            "lo",
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(255, 0, 0, 0),
        )
        .unwrap()]))
    }

    fn manager(factory: Arc<dyn SessionFactory>) -> CallManager {
        let control = Arc::new(ControlServer::new(
            ControlOptions {
                port: 0,
                bind_address: Ipv4Addr::LOCALHOST,
            },
            loopback(),
        ));
        control.start().unwrap();
        let initiator = CallInitiator::new(loopback()).with_timeout(Duration::from_secs(2));
        CallManager::new(control, initiator, factory)
    }

    fn wait_for_pending(manager: &CallManager) {
        for _ in 0..200 {
            if manager.control().pending().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("offer never arrived");
    }

    fn offer_from(caller: &UdpSocket, manager: &CallManager, media_port: u16) {
        let port = manager.control().local_port().unwrap();
        let offer = Message::Offer {
            caller_media_port: media_port,
        };
        caller
            .send_to(&offer.encode().unwrap(), (Ipv4Addr::LOCALHOST, port))
            .unwrap();
        wait_for_pending(manager);
    }

    #[test]
    fn test_idle_status_and_empty_operations() {
        let manager = manager(Arc::new(MemorySessionFactory));
        assert_eq!(manager.status(), CallStatus::NoCall);
        assert!(!manager.hangup());
        assert!(matches!(manager.accept(), Err(Error::Call(CallError::NoPendingOffer))));
        assert!(matches!(manager.reject(), Err(Error::Call(CallError::NoPendingOffer))));
    }

    #[test]
    fn test_accept_then_second_accept_refused() {
        let manager = manager(Arc::new(MemorySessionFactory));
        let caller = UdpSocket::bind("127.0.0.1:0").unwrap();
        offer_from(&caller, &manager, 45_000);
        assert!(matches!(manager.status(), CallStatus::PendingCall { .. }));

        let info = manager.accept().unwrap();
        assert_eq!(info.direction, CallDirection::Incoming);
        assert_eq!(info.peer_media_port, 45_000);
        assert!(manager.in_call());

        // A second offer while in a call cannot be accepted
        offer_from(&caller, &manager, 45_001);
        assert!(matches!(manager.accept(), Err(Error::Call(CallError::AlreadyInCall))));
        assert!(matches!(manager.status(), CallStatus::ActiveCall { .. }));

        // Nor can a call be placed
        assert!(matches!(
            manager.start_call(Ipv4Addr::LOCALHOST, 9),
            Err(Error::Call(CallError::AlreadyInCall))
        ));

        assert!(manager.hangup());
        assert!(!manager.hangup());
        assert!(matches!(manager.status(), CallStatus::PendingCall { .. }));
    }

    #[test]
    fn test_start_call_refused_while_offer_pending() {
        let manager = manager(Arc::new(MemorySessionFactory));
        let caller = UdpSocket::bind("127.0.0.1:0").unwrap();
        offer_from(&caller, &manager, 45_002);

        assert!(matches!(
            manager.start_call(Ipv4Addr::LOCALHOST, 9),
            Err(Error::Call(CallError::OfferPending))
        ));
        manager.reject().unwrap();
        assert_eq!(manager.status(), CallStatus::NoCall);
    }

    #[test]
    fn test_failed_handshake_returns_to_idle() {
        let manager = manager(Arc::new(MemorySessionFactory));
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let result = manager.start_call(Ipv4Addr::LOCALHOST, port);
        assert!(matches!(result, Err(Error::Network(NetworkError::HandshakeTimeout(_)))));
        assert_eq!(manager.status(), CallStatus::NoCall);
    }

    #[test]
    fn test_failed_audio_keeps_slot_free() {
        let manager = manager(Arc::new(FailingFactory));
        let caller = UdpSocket::bind("127.0.0.1:0").unwrap();
        offer_from(&caller, &manager, 45_003);

        assert!(matches!(manager.accept(), Err(Error::Audio(_))));
        assert_eq!(manager.status(), CallStatus::NoCall);
        assert!(!manager.in_call());
    }

    #[test]
    fn test_slot_stays_responsive_while_devices_open() {
        let manager = Arc::new(manager(Arc::new(SlowFactory {
            delay: Duration::from_millis(800),
        })));
        let caller = UdpSocket::bind("127.0.0.1:0").unwrap();
        offer_from(&caller, &manager, 45_005);

        let accepting = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.accept())
        };

        let mut connecting = false;
        for _ in 0..100 {
            if let CallStatus::Connecting { direction, .. } = manager.status() {
                assert_eq!(direction, CallDirection::Incoming);
                connecting = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(connecting, "slot never reported connecting");

        // None of these wait for the devices
        let started = std::time::Instant::now();
        assert!(!manager.in_call());
        assert!(!manager.hangup());
        assert!(matches!(manager.accept(), Err(Error::Call(CallError::AlreadyInCall))));
        assert!(matches!(
            manager.start_call(Ipv4Addr::LOCALHOST, 9),
            Err(Error::Call(CallError::AlreadyInCall))
        ));
        manager.set_volume(Some(20), None);
        assert_eq!(manager.volume().input, 20);
        assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());

        // The change made while opening reaches the session
        let info = accepting.join().unwrap().unwrap();
        assert_eq!(info.volumes.input, 20);
        assert!(manager.in_call());
        assert!(manager.hangup());
    }

    #[test]
    fn test_volume_carries_into_session() {
        let manager = manager(Arc::new(MemorySessionFactory));
        assert_eq!(manager.set_volume(Some(250), None), Volumes { input: 100, output: 100 });
        assert_eq!(manager.set_volume(Some(30), Some(-1)), Volumes { input: 30, output: 0 });

        let caller = UdpSocket::bind("127.0.0.1:0").unwrap();
        offer_from(&caller, &manager, 45_004);
        let info = manager.accept().unwrap();
        assert_eq!(info.volumes, Volumes { input: 30, output: 0 });

        manager.set_volume(None, Some(80));
        assert_eq!(manager.volume(), Volumes { input: 30, output: 80 });
        manager.shutdown();
        assert_eq!(manager.volume(), Volumes { input: 30, output: 80 });
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let json = serde_json::to_value(CallStatus::Dialing {
            peer_ip: Ipv4Addr::new(10, 0, 0, 2),
        })
        .unwrap();
        assert_eq!(json["state"], "dialing");
        assert_eq!(json["peer_ip"], "10.0.0.2");
        assert_eq!(serde_json::to_value(CallStatus::NoCall).unwrap()["state"], "no_call");
    }
}
