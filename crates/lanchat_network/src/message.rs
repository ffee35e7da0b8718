//! Typed envelopes exchanged over UDP and TCP.

use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::identity::{PeerId, PeerIdentity};

/// A protocol message. Serialized as a JSON object whose `type` field selects
/// the variant; unknown types fail to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Host presence announcement (UDP only).
    Discovery {
        host_ip: Ipv4Addr,
        chat_port: u16,
        host_id: PeerId,
        host_name: String,
    },
    /// Sent by the host right after accepting a connection.
    RequestName {
        #[serde(alias = "data")]
        host_id: PeerId,
    },
    /// Sent by the client right after connecting.
    NameIntro { id: PeerId, name: String },
    /// A chat line, relayed verbatim by the host.
    ChatMessage {
        sender_id: PeerId,
        content: String,
        #[serde(deserialize_with = "lenient_timestamp")]
        timestamp: DateTime<Utc>,
    },
}

/// Accepts RFC 3339 as well as ISO-8601 without an offset (read as UTC).
/// A timestamp that matches neither is replaced with the time of receipt.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(parse_timestamp(&raw).unwrap_or_else(Utc::now))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// The kind of an [`Envelope`], for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Discovery,
    RequestName,
    NameIntro,
    ChatMessage,
}

impl EnvelopeKind {
    /// The wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::RequestName => "request_name",
            Self::NameIntro => "name_intro",
            Self::ChatMessage => "chat_message",
        }
    }
}

impl Envelope {
    /// Build a discovery announcement for `identity` hosting at `host_ip:chat_port`.
    pub fn discovery(identity: &PeerIdentity, host_ip: Ipv4Addr, chat_port: u16) -> Self {
        Self::Discovery {
            host_ip,
            chat_port,
            host_id: identity.id.clone(),
            host_name: identity.name.clone(),
        }
    }

    /// Build the host's opening frame.
    pub fn request_name(host: &PeerIdentity) -> Self {
        Self::RequestName {
            host_id: host.id.clone(),
        }
    }

    /// Build the client's opening frame.
    pub fn name_intro(identity: &PeerIdentity) -> Self {
        Self::NameIntro {
            id: identity.id.clone(),
            name: identity.name.clone(),
        }
    }

    /// Build a chat message stamped with the current time.
    pub fn chat(sender_id: PeerId, content: impl Into<String>) -> Self {
        Self::ChatMessage {
            sender_id,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Discovery { .. } => EnvelopeKind::Discovery,
            Self::RequestName { .. } => EnvelopeKind::RequestName,
            Self::NameIntro { .. } => EnvelopeKind::NameIntro,
            Self::ChatMessage { .. } => EnvelopeKind::ChatMessage,
        }
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize an envelope from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> PeerIdentity {
        PeerIdentity {
            id: PeerId::from_string("host-1"),
            name: "Hana".to_string(),
        }
    }

    #[test]
    fn test_discovery_wire_shape() {
        let env = Envelope::discovery(&identity(), Ipv4Addr::new(10, 0, 0, 5), 12345);
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "discovery",
                "host_ip": "10.0.0.5",
                "chat_port": 12345,
                "host_id": "host-1",
                "host_name": "Hana",
            })
        );
    }

    #[test]
    fn test_request_name_accepts_legacy_data_field() {
        let env = Envelope::from_json(r#"{"type":"request_name","data":"host-9"}"#).unwrap();
        assert_eq!(
            env,
            Envelope::RequestName {
                host_id: PeerId::from_string("host-9")
            }
        );
    }

    #[test]
    fn test_chat_message_parses() {
        let json = r#"{"type":"chat_message","sender_id":"a","content":"oi","timestamp":"2024-05-01T12:00:00Z"}"#;
        match Envelope::from_json(json).unwrap() {
            Envelope::ChatMessage {
                sender_id, content, ..
            } => {
                assert_eq!(sender_id.as_str(), "a");
                assert_eq!(content, "oi");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_chat_message_accepts_timestamp_without_offset() {
        let json = r#"{"type":"chat_message","sender_id":"a","content":"oi","timestamp":"2024-05-01T12:00:00.123456"}"#;
        match Envelope::from_json(json).unwrap() {
            Envelope::ChatMessage { timestamp, .. } => {
                assert_eq!(
                    timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                    "2024-05-01 12:00:00.123456"
                );
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_chat_message_with_unreadable_timestamp_still_parses() {
        let json = r#"{"type":"chat_message","sender_id":"a","content":"oi","timestamp":"yesterday"}"#;
        let before = Utc::now();
        match Envelope::from_json(json).unwrap() {
            Envelope::ChatMessage { timestamp, .. } => assert!(timestamp >= before),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Envelope::from_json(r#"{"type":"file_transfer","id":"x"}"#).is_err());
        assert!(Envelope::from_json(r#"{"id":"x","name":"y"}"#).is_err());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        assert!(Envelope::from_json(r#"{"type":"name_intro","id":"x"}"#).is_err());
        assert!(Envelope::from_json(r#"{"type":"chat_message","sender_id":"x"}"#).is_err());
    }

    #[test]
    fn test_newlines_are_escaped() {
        let env = Envelope::chat(PeerId::from_string("a"), "line one\nline two");
        let json = env.to_json().unwrap();
        assert!(!json.contains('\n'));
        assert_eq!(Envelope::from_json(&json).unwrap(), env);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Envelope::name_intro(&identity()).kind().as_str(), "name_intro");
        assert_eq!(Envelope::request_name(&identity()).kind(), EnvelopeKind::RequestName);
    }
}
