//! # LAN Voice
//!
//! Peer-to-peer voice calls on a local network.
//!
//! ## Architecture Overview
//!
//! ```text
//!   every peer
//!  ┌───────────────────────────────────────────────────────────────┐
//!  │  DiscoveryService        ControlServer          CallManager   │
//!  │  ┌──────────────┐        ┌──────────────┐      ┌───────────┐  │
//!  │  │ beacon loop  │──BEACON/BYE (broadcast)──▶   │ call slot │  │
//!  │  │ listen loop  │──▶ PeerRegistry              │           │  │
//!  │  └──────────────┘        │ control loop │◀─────│ accept    │  │
//!  │                          │ PendingOffer │      │ reject    │  │
//!  │   CallInitiator ──OFFER──▶──RINGING/ACCEPT/REJECT           │  │
//!  │                          └──────────────┘      │ start_call│  │
//!  │                                                └─────┬─────┘  │
//!  │                    AudioSession (one per call)       │        │
//!  │                ┌─────────────┐   ┌──────────────┐    │        │
//!  │   capture ───▶ │  send loop  │   │ receive loop │ ──▶ playback│
//!  │                └──────┬──────┘   └──────▲───────┘             │
//!  └───────────────────────┼─────────────────┼─────────────────────┘
//!                          ▼   raw PCM UDP   │
//!                          └──── remote ─────┘
//! ```
//!
//! Every loop runs on its own thread and polls a stop flag between short
//! socket timeouts, so every `stop()` returns within roughly one timeout.

pub mod audio;
pub mod call;
pub mod config;
pub mod discovery;
pub mod error;
pub mod network;
pub mod protocol;
pub mod signaling;
pub mod ui;
pub mod worker;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Advertised display name when none is configured
    pub const DEFAULT_DISPLAY_NAME: &str = "Concord";

    /// UDP port for BEACON/BYE broadcasts
    pub const DEFAULT_BROADCAST_PORT: u16 = 37020;

    /// UDP port the signaling responder listens on
    pub const DEFAULT_CONTROL_PORT: u16 = 38020;

    /// Port of the local HTTP control surface
    pub const DEFAULT_API_PORT: u16 = 5001;

    pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(1);

    /// Silence after which a peer stops being listed
    pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(15);

    /// Silence after which a peer is deleted outright
    pub const DEFAULT_PRUNE_AFTER: Duration = Duration::from_secs(300);

    /// Overall deadline of an outgoing handshake
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

    pub const OFFER_RESEND_INTERVAL: Duration = Duration::from_secs(1);

    /// Read timeout of the discovery and control sockets
    pub const RECV_TIMEOUT: Duration = Duration::from_millis(500);

    /// Read timeout of the media socket and capture reads
    pub const MEDIA_RECV_TIMEOUT: Duration = Duration::from_millis(200);

    /// Receive buffer for signaling and discovery datagrams
    pub const MAX_CONTROL_DATAGRAM: usize = 2048;
}
