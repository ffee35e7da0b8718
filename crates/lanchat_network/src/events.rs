//! Events a session reports for local display.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::identity::PeerId;
use crate::protocol::Role;

/// Something the user should see.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Host listener is up.
    Hosting { addr: SocketAddr, host_id: PeerId },
    /// Announcements are going out to `target`.
    Announcing { target: SocketAddr },
    /// Client connected to its host.
    JoinedHost { addr: SocketAddr },
    /// Host accepted a connection.
    PeerConnected { addr: SocketAddr },
    /// A client introduced itself to the host.
    PeerIntroduced {
        addr: SocketAddr,
        id: PeerId,
        name: String,
    },
    /// An id entered the contact directory.
    ContactAdded { id: PeerId, name: String },
    /// A chat line was delivered or sent.
    Chat {
        sender_id: PeerId,
        sender_name: String,
        content: String,
        is_local: bool,
        timestamp: DateTime<Utc>,
    },
    /// A connection left the registry.
    PeerDisconnected {
        addr: SocketAddr,
        name: Option<String>,
    },
    /// The session has ended.
    Stopped { role: Role },
}

/// Receiving end handed to the UI.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Optional sender; sessions without a listener drop events silently.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    /// A sink and the receiver that observes it.
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            // The UI may have gone away; events are best-effort.
            let _ = tx.send(event);
        }
    }
}
