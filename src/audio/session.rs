//! Media transport for one call
//!
//! Two loops share one UDP socket. The send loop reads a frame from the
//! source, scales it by the input gain and sends it as one datagram to
//! the remote address. The receive loop plays every datagram it gets,
//! scaled by the output gain, in arrival order and without any
//! sequencing. Both loops are best-effort: device and socket failures are
//! logged and the loop carries on.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::audio::frame::{
    apply_gain, clamp_volume, decode_frame, encode_frame, volume_to_gain, Volumes, FRAME_BYTES,
};
use crate::constants::MEDIA_RECV_TIMEOUT;
use crate::error::{AudioError, NetworkError, Result};
use crate::network::udp::{create_socket, is_timeout, SocketOptions};
use crate::worker::{self, JOIN_TIMEOUT};

/// Where outgoing frames come from
pub trait FrameSource: Send {
    /// Next captured frame, or `None` when nothing arrived within `timeout`
    fn read_frame(&mut self, timeout: Duration) -> std::result::Result<Option<Vec<i16>>, AudioError>;

    /// Release the device
    fn close(&mut self) {}
}

/// Where incoming frames go
pub trait FrameSink: Send {
    fn write_frame(&mut self, samples: &[i16]) -> std::result::Result<(), AudioError>;

    /// Release the device
    fn close(&mut self) {}
}

/// Frame counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

struct Gains {
    input: Mutex<u8>,
    output: Mutex<u8>,
}

impl Gains {
    fn input(&self) -> f32 {
        volume_to_gain(*self.input.lock())
    }

    fn output(&self) -> f32 {
        volume_to_gain(*self.output.lock())
    }
}

/// A running audio call
pub struct AudioSession {
    local: SocketAddr,
    remote: SocketAddrV4,
    running: Arc<AtomicBool>,
    gains: Arc<Gains>,
    counters: Arc<Counters>,
    sender: Option<JoinHandle<Box<dyn FrameSource>>>,
    receiver: Option<JoinHandle<Box<dyn FrameSink>>>,
    socket: Option<Arc<UdpSocket>>,
}

impl AudioSession {
    /// Start both loops on an already bound socket
    pub fn start(
        socket: UdpSocket,
        remote: SocketAddrV4,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        volumes: Volumes,
    ) -> Result<Self> {
        socket.set_read_timeout(Some(MEDIA_RECV_TIMEOUT))?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);

        let running = Arc::new(AtomicBool::new(true));
        let gains = Arc::new(Gains {
            input: Mutex::new(volumes.input.min(100)),
            output: Mutex::new(volumes.output.min(100)),
        });
        let counters = Arc::new(Counters::default());

        let sender = {
            let socket = socket.clone();
            let running = running.clone();
            let gains = gains.clone();
            let counters = counters.clone();
            worker::spawn("audio-send", move || {
                send_loop(&socket, remote, source, &running, &gains, &counters)
            })
        };
        let sender = match sender {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let receiver = {
            let socket = socket.clone();
            let running = running.clone();
            let gains = gains.clone();
            let counters = counters.clone();
            worker::spawn("audio-receive", move || {
                receive_loop(&socket, sink, &running, &gains, &counters)
            })
        };
        let receiver = match receiver {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                if let Some(mut source) = worker::join_bounded(sender, JOIN_TIMEOUT) {
                    source.close();
                }
                return Err(e.into());
            }
        };

        tracing::info!("Audio session {} <-> {}", local, remote);

        Ok(Self {
            local,
            remote,
            running,
            gains,
            counters,
            sender: Some(sender),
            receiver: Some(receiver),
            socket: Some(socket),
        })
    }

    /// Bind `local` and start
    pub fn bind(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        volumes: Volumes,
    ) -> Result<Self> {
        let socket = create_socket(SocketOptions::bind(local).read_timeout(MEDIA_RECV_TIMEOUT))?;
        Self::start(socket, remote, source, sink, volumes)
    }

    /// Open capture and playback devices and start
    ///
    /// Either device failing to open fails the whole session; nothing is
    /// left running.
    pub fn open_devices(
        socket: UdpSocket,
        remote: SocketAddrV4,
        devices: &crate::audio::DeviceSelection,
        volumes: Volumes,
    ) -> Result<Self> {
        let mut source = crate::audio::DeviceCapture::open(devices.input.as_deref())?;
        let sink = match crate::audio::DevicePlayback::open(devices.output.as_deref()) {
            Ok(sink) => sink,
            Err(e) => {
                source.close();
                return Err(e.into());
            }
        };
        Self::start(socket, remote, Box::new(source), Box::new(sink), volumes)
    }

    /// Set the capture volume; returns the clamped value
    pub fn set_input_volume(&self, pct: i64) -> u8 {
        let pct = clamp_volume(pct);
        *self.gains.input.lock() = pct;
        pct
    }

    /// Set the playback volume; returns the clamped value
    pub fn set_output_volume(&self, pct: i64) -> u8 {
        let pct = clamp_volume(pct);
        *self.gains.output.lock() = pct;
        pct
    }

    pub fn volumes(&self) -> Volumes {
        Volumes {
            input: *self.gains.input.lock(),
            output: *self.gains.output.lock(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            frames_received: self.counters.received.load(Ordering::Relaxed),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop both loops, then release devices, then the socket
    ///
    /// A loop that does not exit in time is detached together with the
    /// device it owns.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.socket.is_none() {
            return;
        }

        let source = self
            .sender
            .take()
            .and_then(|handle| worker::join_bounded(handle, JOIN_TIMEOUT));
        let sink = self
            .receiver
            .take()
            .and_then(|handle| worker::join_bounded(handle, JOIN_TIMEOUT));

        if let Some(mut source) = source {
            source.close();
        }
        if let Some(mut sink) = sink {
            sink.close();
        }
        self.socket = None;

        let stats = self.stats();
        tracing::info!(
            "Audio session with {} stopped ({} frames sent, {} received)",
            self.remote,
            stats.frames_sent,
            stats.frames_received
        );
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_loop(
    socket: &UdpSocket,
    remote: SocketAddrV4,
    mut source: Box<dyn FrameSource>,
    running: &AtomicBool,
    gains: &Gains,
    counters: &Counters,
) -> Box<dyn FrameSource> {
    while running.load(Ordering::Relaxed) {
        let mut frame = match source.read_frame(MEDIA_RECV_TIMEOUT) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Capture failed: {}", e);
                std::thread::sleep(MEDIA_RECV_TIMEOUT);
                continue;
            }
        };

        apply_gain(&mut frame, gains.input());
        match socket.send_to(&encode_frame(&frame), remote) {
            Ok(_) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!("{}", NetworkError::SendFailed(e.to_string()));
            }
        }
    }
    source
}

fn receive_loop(
    socket: &UdpSocket,
    mut sink: Box<dyn FrameSink>,
    running: &AtomicBool,
    gains: &Gains,
    counters: &Counters,
) -> Box<dyn FrameSink> {
    // Room for more than one frame so an oversized datagram is not truncated silently
    let mut buf = vec![0u8; FRAME_BYTES * 2];

    while running.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                tracing::debug!("Media receive failed: {}", e);
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
        };

        let mut frame = decode_frame(&buf[..len]);
        if frame.is_empty() {
            continue;
        }
        apply_gain(&mut frame, gains.output());
        counters.received.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = sink.write_frame(&frame) {
            tracing::warn!("Playback failed: {}", e);
        }
    }
    sink
}
