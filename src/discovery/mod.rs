//! Serverless LAN peer discovery

pub mod registry;
pub mod service;

pub use registry::{Peer, PeerRegistry};
pub use service::{DiscoveryOptions, DiscoveryService};
