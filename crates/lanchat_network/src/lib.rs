//! LAN Chat networking — discovery, handshake, and relay.
//!
//! One process hosts a chat room; others find it over UDP broadcast and join
//! over TCP. The host re-broadcasts every chat line it receives to all other
//! connected clients.
//!
//! # Architecture
//!
//! - **Discovery**: a hosting session announces itself on the discovery port;
//!   a joining process listens for a fixed window and picks a host.
//! - **Transport**: newline-delimited JSON frames over TCP.
//! - **Protocol**: a four-envelope wire format and a small handshake
//!   (`request_name` / `name_intro`) that never blocks chat.
//! - **Relay**: a connection registry plus per-connection read loops; the host
//!   forwards frames verbatim to every connection except the sender.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lanchat_network::{HostSession, NetworkConfig, PeerIdentity, Session, SessionContext};
//!
//! # async fn example() {
//! let ctx = SessionContext::new(PeerIdentity::generate("Hana"), NetworkConfig::default());
//! let mut host = HostSession::new(ctx);
//!
//! host.start().await.unwrap();
//! host.send_chat("hello, LAN").await.unwrap();
//! host.stop().await;
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod contacts;
pub mod discovery;
pub mod error;
pub mod events;
pub mod history;
pub mod identity;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use contacts::ContactDirectory;
pub use discovery::{DiscoveredHost, Selection};
pub use error::NetworkError;
pub use events::{EventReceiver, EventSink, SessionEvent};
pub use history::{HistoryEntry, MessageHistory};
pub use identity::{PeerId, PeerIdentity};
pub use message::{Envelope, EnvelopeKind};
pub use protocol::Role;
pub use registry::ConnectionRegistry;
pub use session::{ClientSession, HostSession, LifecycleState, Session, SessionContext};
