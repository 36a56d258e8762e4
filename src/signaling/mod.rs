//! Call signaling over UDP: OFFER / RINGING / ACCEPT / REJECT

pub mod initiator;
pub mod server;

pub use initiator::{initiate_call, CallInitiator, OutgoingCall};
pub use server::{AcceptedCall, ControlOptions, ControlServer, PendingOffer};
