//! Error types for discovery, signaling and the audio session

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start stream: {0}")]
    StreamPlay(String),

    #[error("Device thread failed: {0}")]
    DeviceThread(String),
}

/// Socket and handshake errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Interface listing failed: {0}")]
    Interfaces(String),

    #[error("No reply from peer within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Call rejected by peer")]
    Rejected,

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Call-slot conflicts, surfaced to the caller as explicit failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("A call is already active")]
    AlreadyInCall,

    #[error("An outgoing call is already being placed")]
    Dialing,

    #[error("An incoming call is waiting for an answer")]
    OfferPending,

    #[error("No pending call")]
    NoPendingOffer,
}

/// Signaling and discovery payload errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed datagram: {0}")]
    Malformed(String),

    #[error("Encoding failed: {0}")]
    Encode(String),
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::StreamBuild(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::StreamPlay(err.to_string())
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
