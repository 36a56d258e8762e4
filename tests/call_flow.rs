//! Full call over loopback: OFFER, RINGING, ACCEPT, then audio both ways

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_voice::audio::frame::FRAME_SAMPLES;
use lan_voice::audio::{AudioSession, MemorySink, MemorySource, Volumes};
use lan_voice::call::{CallManager, CallStatus, MemorySessionFactory};
use lan_voice::error::{Error, NetworkError};
use lan_voice::network::{InterfaceLister, NetworkInterface, StaticInterfaces};
use lan_voice::protocol::Message;
use lan_voice::signaling::{initiate_call, CallInitiator, ControlOptions, ControlServer};

fn loopback() -> Arc<dyn InterfaceLister> {
    Arc::new(StaticInterfaces(vec![NetworkInterface::new(
        "lo",
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::new(255, 255, 255, 0),
    )
    .unwrap()]))
}

fn control_server() -> Arc<ControlServer> {
    let server = Arc::new(ControlServer::new(
        ControlOptions {
            port: 0,
            bind_address: Ipv4Addr::LOCALHOST,
        },
        loopback(),
    ));
    server.start().unwrap();
    server
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn handshake_parameters_connect_two_sessions() {
    let b_control = control_server();
    let b_port = b_control.local_port().unwrap();

    let caller = thread::spawn(move || {
        initiate_call(Ipv4Addr::LOCALHOST, b_port, Duration::from_secs(5), loopback())
    });

    assert!(wait_for(Duration::from_secs(3), || b_control.pending().is_some()));
    let accepted = b_control.accept_pending().unwrap();
    let outgoing = caller.join().unwrap().unwrap();

    assert_eq!(accepted.peer_ip, Ipv4Addr::LOCALHOST);
    assert_eq!(accepted.peer_media_port, outgoing.local_media_port);
    assert_eq!(outgoing.remote_media_port, accepted.my_media_port);
    assert_eq!(outgoing.local_ip, Ipv4Addr::LOCALHOST);
    assert_eq!(accepted.local_ip, Ipv4Addr::LOCALHOST);

    let a_sink = MemorySink::new();
    let b_sink = MemorySink::new();
    let mut a = AudioSession::start(
        outgoing.media_socket,
        SocketAddrV4::new(outgoing.remote_ip, outgoing.remote_media_port),
        Box::new(MemorySource::constant(111, 4)),
        Box::new(a_sink.clone()),
        Volumes::default(),
    )
    .unwrap();
    let mut b = AudioSession::start(
        accepted.media_socket,
        SocketAddrV4::new(accepted.peer_ip, accepted.peer_media_port),
        Box::new(MemorySource::constant(-222, 4)),
        Box::new(b_sink.clone()),
        Volumes::default(),
    )
    .unwrap();

    assert!(wait_for(Duration::from_secs(3), || {
        a_sink.frames().len() == 4 && b_sink.frames().len() == 4
    }));
    assert!(b_sink.frames().iter().all(|f| f.len() == FRAME_SAMPLES && f.iter().all(|&s| s == 111)));
    assert!(a_sink.frames().iter().all(|f| f.iter().all(|&s| s == -222)));

    a.stop();
    b.stop();
    b_control.stop();
}

#[test]
fn reject_reaches_caller_quickly() {
    let b_control = control_server();
    let b_port = b_control.local_port().unwrap();

    let started = Instant::now();
    let caller = thread::spawn(move || {
        initiate_call(Ipv4Addr::LOCALHOST, b_port, Duration::from_secs(10), loopback())
    });

    assert!(wait_for(Duration::from_secs(3), || b_control.pending().is_some()));
    b_control.reject_pending().unwrap();

    let result = caller.join().unwrap();
    assert!(matches!(result, Err(Error::Network(NetworkError::Rejected))));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(b_control.pending().is_none());
}

#[test]
fn displaced_caller_is_rejected() {
    let b_control = control_server();
    let b_port = b_control.local_port().unwrap();

    let first = thread::spawn(move || {
        initiate_call(Ipv4Addr::LOCALHOST, b_port, Duration::from_secs(10), loopback())
    });
    assert!(wait_for(Duration::from_secs(3), || b_control.pending().is_some()));
    let first_offer = b_control.pending().unwrap();

    // A second caller takes the slot
    let second = UdpSocket::bind("127.0.0.1:0").unwrap();
    let offer = Message::Offer {
        caller_media_port: 47_000,
    };
    second
        .send_to(&offer.encode().unwrap(), (Ipv4Addr::LOCALHOST, b_port))
        .unwrap();

    let result = first.join().unwrap();
    assert!(matches!(result, Err(Error::Network(NetworkError::Rejected))));
    let pending = b_control.pending().unwrap();
    assert_ne!(pending.peer_reply_address, first_offer.peer_reply_address);
    assert_eq!(pending.peer_media_port, 47_000);
}

#[test]
fn call_managers_on_both_ends() {
    let a_control = control_server();
    let b_control = control_server();
    let b_port = b_control.local_port().unwrap();

    let a = Arc::new(CallManager::new(
        a_control,
        CallInitiator::new(loopback()).with_timeout(Duration::from_secs(5)),
        Arc::new(MemorySessionFactory),
    ));
    let b = Arc::new(CallManager::new(
        b_control,
        CallInitiator::new(loopback()),
        Arc::new(MemorySessionFactory),
    ));

    let dialer = {
        let a = a.clone();
        thread::spawn(move || a.start_call(Ipv4Addr::LOCALHOST, b_port))
    };

    assert!(wait_for(Duration::from_secs(3), || matches!(
        b.status(),
        CallStatus::PendingCall { .. }
    )));
    assert!(matches!(a.status(), CallStatus::Dialing { .. }));

    let incoming = b.accept().unwrap();
    let outgoing = dialer.join().unwrap().unwrap();
    assert_eq!(incoming.peer_media_port, outgoing.local_media_port);
    assert_eq!(outgoing.peer_media_port, incoming.local_media_port);
    assert!(a.in_call() && b.in_call());

    assert!(a.hangup());
    assert!(b.hangup());
    assert_eq!(a.status(), CallStatus::NoCall);
    assert_eq!(b.status(), CallStatus::NoCall);
}
