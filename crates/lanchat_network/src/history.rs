//! In-memory message history for local display.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Recipient recorded for a host's local compose.
pub const ALL_RECIPIENTS: &str = "ALL";

/// One delivered or sent chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender_id: PeerId,
    pub recipient: String,
    pub content: String,
    /// Composed on this machine.
    pub is_local: bool,
    pub timestamp: DateTime<Utc>,
}

/// Append-only, process-lifetime message log.
#[derive(Debug, Default)]
pub struct MessageHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: HistoryEntry) {
        self.entries.lock().push(entry);
    }

    /// Record a line composed locally.
    pub fn record_local(&self, sender_id: &PeerId, recipient: &str, content: &str) {
        self.append(HistoryEntry {
            sender_id: sender_id.clone(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            is_local: true,
            timestamp: Utc::now(),
        });
    }

    /// Record a line received from a peer.
    pub fn record_received(&self, sender_id: &PeerId, local_id: &PeerId, content: &str) {
        self.append(HistoryEntry {
            sender_id: sender_id.clone(),
            recipient: local_id.to_string(),
            content: content.to_string(),
            is_local: false,
            timestamp: Utc::now(),
        });
    }

    /// Copy of every entry in arrival order.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
