//! Peer wire types
//!
//! Every message between two nodes travels inside an [`Envelope`]:
//! ```text
//! { "seq": 7, "response": false, "payload": { "type": "add-drone", ... }, "my-name": "north-ridge" }
//! ```
//! `my-name` is only present on the first envelope a side sends on a pipe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A network address a node can be reached on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ipaddr: String,
    pub intf: String,
}

impl PeerAddress {
    pub fn new(ipaddr: impl Into<String>, intf: impl Into<String>) -> Self {
        Self {
            ipaddr: ipaddr.into(),
            intf: intf.into(),
        }
    }

    /// Tunnel interfaces are preferred when peers pick an address to dial
    pub fn is_tunnel(&self) -> bool {
        self.intf.starts_with("tun")
    }
}

/// Correlated envelope carried over a pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub response: bool,
    pub payload: Value,
    #[serde(rename = "my-name", default, skip_serializing_if = "Option::is_none")]
    pub my_name: Option<String>,
}

impl Envelope {
    /// Create a request envelope
    pub fn request(seq: u64, payload: Value) -> Self {
        Self {
            seq,
            response: false,
            payload,
            my_name: None,
        }
    }

    /// Create a response envelope echoing the request's sequence number
    pub fn response(seq: u64, payload: Value) -> Self {
        Self {
            seq,
            response: true,
            payload,
            my_name: None,
        }
    }
}

/// Payloads exchanged between nodes, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum PeerMessage {
    /// First request on an outbound pipe
    Hello {
        my_id: String,
        #[serde(default)]
        my_addrs: Vec<PeerAddress>,
    },
    HelloAck {
        my_id: String,
        #[serde(default)]
        my_active_dronelist: Vec<String>,
        #[serde(default)]
        ct_rtt: f64,
    },
    /// Ownership claim for a newly seen drone
    AddDrone {
        rid: String,
        #[serde(default)]
        drone_timestamp_ms: i64,
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance_from_me: Option<f64>,
        #[serde(default)]
        ct_rtt: f64,
    },
    /// Claim accepted: the claimant may publish
    AddDroneAck {
        rid: String,
        #[serde(default)]
        note: String,
    },
    /// Claim rejected: the responder publishes
    AddDroneNack {
        rid: String,
        #[serde(default)]
        note: String,
    },
    /// Owner released the drone
    DropDrone {
        rid: String,
        #[serde(default)]
        ct_rtt: f64,
    },
    DropDroneAck {
        rid: String,
    },
    /// Sighting forwarded to the owner
    Seen {
        rid: String,
        lat: f64,
        lng: f64,
        ts: i64,
        #[serde(default)]
        ct_rtt: f64,
        #[serde(default)]
        r2c_rtt: f64,
    },
    SeenAck {
        rid: String,
        #[serde(default)]
        ct_rtt: f64,
        #[serde(default)]
        r2c_rtt: f64,
        #[serde(default)]
        archived: bool,
    },
    SeenNack {
        rid: String,
        #[serde(default)]
        diag: String,
    },
    NameChange {
        rid: String,
        mapped_id: String,
    },
    NameChangeAck {
        rid: String,
    },
    DroneStatus {
        rid: String,
    },
    DroneStatusAck {
        rid: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    /// Sender is shutting down, no reply expected
    Leaving {},
    Error {
        diag: String,
    },
}

impl PeerMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::HelloAck { .. } => "hello-ack",
            PeerMessage::AddDrone { .. } => "add-drone",
            PeerMessage::AddDroneAck { .. } => "add-drone-ack",
            PeerMessage::AddDroneNack { .. } => "add-drone-nack",
            PeerMessage::DropDrone { .. } => "drop-drone",
            PeerMessage::DropDroneAck { .. } => "drop-drone-ack",
            PeerMessage::Seen { .. } => "seen",
            PeerMessage::SeenAck { .. } => "seen-ack",
            PeerMessage::SeenNack { .. } => "seen-nack",
            PeerMessage::NameChange { .. } => "name-change",
            PeerMessage::NameChangeAck { .. } => "name-change-ack",
            PeerMessage::DroneStatus { .. } => "drone-status",
            PeerMessage::DroneStatusAck { .. } => "drone-status-ack",
            PeerMessage::Leaving {} => "leaving",
            PeerMessage::Error { .. } => "error",
        }
    }

    /// Build an error reply
    pub fn error(diag: impl Into<String>) -> Self {
        PeerMessage::Error { diag: diag.into() }
    }

    /// Drone this message refers to, if any
    pub fn rid(&self) -> Option<&str> {
        match self {
            PeerMessage::AddDrone { rid, .. }
            | PeerMessage::AddDroneAck { rid, .. }
            | PeerMessage::AddDroneNack { rid, .. }
            | PeerMessage::DropDrone { rid, .. }
            | PeerMessage::DropDroneAck { rid }
            | PeerMessage::Seen { rid, .. }
            | PeerMessage::SeenAck { rid, .. }
            | PeerMessage::SeenNack { rid, .. }
            | PeerMessage::NameChange { rid, .. }
            | PeerMessage::NameChangeAck { rid }
            | PeerMessage::DroneStatus { rid }
            | PeerMessage::DroneStatusAck { rid, .. } => Some(rid.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_uses_kebab_case_fields() {
        let msg = PeerMessage::AddDrone {
            rid: "1581F5FJD".into(),
            drone_timestamp_ms: 100,
            lat: 45.5,
            lng: -122.6,
            distance_from_me: Some(30.0),
            ct_rtt: 0.25,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "add-drone");
        assert_eq!(value["drone-timestamp-ms"], 100);
        assert_eq!(value["distance-from-me"], 30.0);
        assert_eq!(value["ct-rtt"], 0.25);
    }

    #[test]
    fn test_unknown_distance_is_omitted() {
        let msg = PeerMessage::AddDrone {
            rid: "D1".into(),
            drone_timestamp_ms: 0,
            lat: 1.0,
            lng: 2.0,
            distance_from_me: None,
            ct_rtt: 0.0,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("distance-from-me").is_none());
    }

    #[test]
    fn test_hello_ack_defaults() {
        let msg: PeerMessage =
            serde_json::from_value(json!({"type": "hello-ack", "my-id": "abc"})).unwrap();
        assert_eq!(
            msg,
            PeerMessage::HelloAck {
                my_id: "abc".into(),
                my_active_dronelist: vec![],
                ct_rtt: 0.0,
            }
        );
        assert_eq!(msg.kind(), "hello-ack");
    }

    #[test]
    fn test_envelope_name_only_when_set() {
        let mut env = Envelope::request(1, json!({"type": "leaving"}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("my-name"));

        env.my_name = Some("ridge".into());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["my-name"], "ridge");
        assert_eq!(value["response"], false);
    }

    #[test]
    fn test_tunnel_address_detection() {
        assert!(PeerAddress::new("10.8.0.2", "tun0").is_tunnel());
        assert!(!PeerAddress::new("192.168.1.4", "wlan0").is_tunnel());
    }
}
