//! Signaling and discovery wire messages
//!
//! Every control datagram is a single JSON object with a `type`
//! discriminator and no other framing:
//!
//! ```text
//! {"type":"BEACON","id":"…","name":"…","username":"…","control_port":38020,"nets":["192.168.1.0/24"]}
//! {"type":"BYE","id":"…"}
//! {"type":"OFFER","caller_media_port":50211}
//! {"type":"RINGING"}
//! {"type":"ACCEPT","callee_media_port":50944}
//! {"type":"REJECT"}
//! ```
//!
//! Unknown fields are ignored. Missing required fields make the whole
//! datagram malformed; callers drop malformed datagrams.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_DISPLAY_NAME;
use crate::error::ProtocolError;

/// A decoded control datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Message {
    /// Periodic presence broadcast
    Beacon {
        id: String,
        #[serde(default = "default_name")]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        control_port: u16,
        /// Network CIDRs of the sender's interfaces, informational only
        #[serde(default)]
        nets: Vec<String>,
    },

    /// One-shot goodbye broadcast at shutdown
    Bye { id: String },

    /// Caller asks the responder's control port for a call
    Offer { caller_media_port: u16 },

    /// Responder saw the offer and is alerting its user
    Ringing,

    /// Responder accepted; media goes to `callee_media_port`
    Accept { callee_media_port: u16 },

    /// Responder declined
    Reject,
}

fn default_name() -> String {
    DEFAULT_DISPLAY_NAME.to_string()
}

impl Message {
    /// Decode one datagram
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(datagram).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode to a datagram payload
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Beacon { .. } => "BEACON",
            Message::Bye { .. } => "BYE",
            Message::Offer { .. } => "OFFER",
            Message::Ringing => "RINGING",
            Message::Accept { .. } => "ACCEPT",
            Message::Reject => "REJECT",
        }
    }
}

/// Audio device description exposed to the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_beacon_wire_shape() {
        let beacon = Message::Beacon {
            id: "A".into(),
            name: "Concord".into(),
            username: Some("alice".into()),
            control_port: 38020,
            nets: vec!["192.168.1.0/24".into()],
        };
        let value: serde_json::Value = serde_json::from_slice(&beacon.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "BEACON",
                "id": "A",
                "name": "Concord",
                "username": "alice",
                "control_port": 38020,
                "nets": ["192.168.1.0/24"],
            })
        );
    }

    #[test]
    fn test_unit_variants_carry_only_type() {
        assert_eq!(Message::Ringing.encode().unwrap(), br#"{"type":"RINGING"}"#);
        assert_eq!(Message::Reject.encode().unwrap(), br#"{"type":"REJECT"}"#);
    }

    #[test]
    fn test_beacon_optional_fields_default() {
        let msg = Message::decode(br#"{"type":"BEACON","id":"B","control_port":1234}"#).unwrap();
        assert_eq!(
            msg,
            Message::Beacon {
                id: "B".into(),
                name: DEFAULT_DISPLAY_NAME.into(),
                username: None,
                control_port: 1234,
                nets: vec![],
            }
        );
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        assert!(Message::decode(br#"{"type":"BEACON","id":"B"}"#).is_err());
        assert!(Message::decode(br#"{"type":"BEACON","control_port":1}"#).is_err());
        assert!(Message::decode(br#"{"type":"BYE"}"#).is_err());
        assert!(Message::decode(br#"{"type":"OFFER"}"#).is_err());
        assert!(Message::decode(br#"{"type":"ACCEPT"}"#).is_err());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(Message::decode(b"\xff\xfe").is_err());
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"type":"HELLO"}"#).is_err());
        assert!(Message::decode(br#"{"id":"A"}"#).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg = Message::decode(br#"{"type":"OFFER","caller_media_port":5000,"extra":true}"#).unwrap();
        assert_eq!(msg, Message::Offer { caller_media_port: 5000 });
    }
}
