//! Stable peer ids and display names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used to derive placeholder names.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The local user's identity. Exactly one per process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub name: String,
}

impl PeerIdentity {
    /// Create a new identity with a fresh id.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            id: PeerId::generate(),
            name: name.into(),
        }
    }
}

/// Name shown for a chat sender nobody has introduced.
pub fn peer_placeholder(id: &PeerId) -> String {
    format!("Peer ({})", id.short())
}

/// Name recorded for a host that asked for our name before we knew its own.
pub fn host_placeholder(id: &PeerId) -> String {
    format!("Host ({})", id.short())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
