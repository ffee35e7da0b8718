//! Session handshake — per-connection state for both roles.
//!
//! The handshake never blocks chat. A host greets with `request_name` and
//! waits for the client's `name_intro`; a client introduces itself and is
//! active immediately. Either side may receive chat before it knows who the
//! remote is.

use chrono::{DateTime, Utc};

use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::message::Envelope;

/// Which side of a session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
        }
    }
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Host: connection accepted, greeting not yet sent.
    Accepted,
    /// Host: greeting sent, waiting for the client's introduction.
    AwaitingIntro,
    /// Client: TCP connected, introduction not yet sent.
    Connected,
    /// Names exchanged (host) or introduction sent (client).
    Active,
}

/// What the relay should do with an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Host: the client told us who it is.
    Introduced { id: PeerId, name: String },
    /// Client: the host identified itself.
    HostIdentified { host_id: PeerId },
    /// Either role: a chat line.
    Chat {
        sender_id: PeerId,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

/// Handshake state machine for a single connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
}

impl Handshake {
    pub fn host() -> Self {
        Self {
            role: Role::Host,
            state: HandshakeState::Accepted,
        }
    }

    pub fn client() -> Self {
        Self {
            role: Role::Client,
            state: HandshakeState::Connected,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The frame this side sends as soon as the connection exists, and the
    /// resulting state transition.
    pub fn opening(&mut self, local: &PeerIdentity) -> Envelope {
        match self.role {
            Role::Host => {
                self.state = HandshakeState::AwaitingIntro;
                Envelope::request_name(local)
            }
            Role::Client => {
                self.state = HandshakeState::Active;
                Envelope::name_intro(local)
            }
        }
    }

    /// Classify an inbound envelope, advancing the state where it applies.
    ///
    /// Envelopes that do not belong on this side of a TCP connection are
    /// protocol errors.
    pub fn accept(&mut self, envelope: Envelope) -> Result<Inbound, NetworkError> {
        match (self.role, envelope) {
            (Role::Host, Envelope::NameIntro { id, name }) => {
                self.state = HandshakeState::Active;
                Ok(Inbound::Introduced { id, name })
            }
            (Role::Client, Envelope::RequestName { host_id }) => {
                Ok(Inbound::HostIdentified { host_id })
            }
            (
                _,
                Envelope::ChatMessage {
                    sender_id,
                    content,
                    timestamp,
                },
            ) => Ok(Inbound::Chat {
                sender_id,
                content,
                timestamp,
            }),
            (role, other) => Err(NetworkError::Protocol(format!(
                "Unexpected {} envelope for {} role",
                other.kind().as_str(),
                role.as_str()
            ))),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == HandshakeState::Active
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
