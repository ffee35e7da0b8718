//! Network configuration for a chat session.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port for chat sessions.
pub const DEFAULT_CHAT_PORT: u16 = 12345;
/// Default UDP port for discovery announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 12346;
/// Default upper bound for a single TCP frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Configuration shared by host and client sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port the host listens on and clients connect to.
    pub chat_port: u16,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    /// Address the host binds and advertises. `None` detects the LAN address.
    pub host_ip: Option<Ipv4Addr>,

    /// Send announcements here instead of the subnet broadcast address.
    pub discovery_target: Option<Ipv4Addr>,

    /// Interval between discovery announcements.
    #[serde(with = "duration_millis")]
    pub announce_interval: Duration,

    /// How long a scan collects announcements.
    #[serde(with = "duration_millis")]
    pub scan_window: Duration,

    /// Upper bound on a single blocking read/accept before the stop flag is
    /// checked again.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Timeout for establishing the client connection.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Timeout for writing one frame to a peer.
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,

    /// Largest accepted TCP frame, newline included.
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chat_port: DEFAULT_CHAT_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            host_ip: None,
            discovery_target: None,
            announce_interval: Duration::from_secs(2),
            scan_window: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NetworkConfig {
    /// A config bound to loopback with ephemeral ports and short timers.
    /// Used by tests and local demos.
    pub fn loopback() -> Self {
        Self {
            chat_port: 0,
            host_ip: Some(Ipv4Addr::LOCALHOST),
            discovery_target: Some(Ipv4Addr::LOCALHOST),
            announce_interval: Duration::from_millis(100),
            scan_window: Duration::from_millis(600),
            poll_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
