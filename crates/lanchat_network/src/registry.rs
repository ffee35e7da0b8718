//! Connection registry — the single source of truth for who is connected.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::FrameSink;

/// A registered connection.
#[derive(Clone)]
pub struct ConnectionRecord {
    pub addr: SocketAddr,
    pub link: Arc<dyn FrameSink>,
    /// Name the remote introduced itself with, once known.
    pub remote_name: Option<String>,
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("addr", &self.addr)
            .field("remote_name", &self.remote_name)
            .finish_non_exhaustive()
    }
}

/// Concurrency-safe table of live connections.
///
/// Every operation holds the lock for its whole duration and none of them
/// performs I/O, so a broadcast works from a [`snapshot`](Self::snapshot)
/// taken at one instant and writes happen outside the lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: Mutex<Vec<ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A record already present under `addr` is
    /// replaced and returned.
    pub fn insert(&self, addr: SocketAddr, link: Arc<dyn FrameSink>) -> Option<ConnectionRecord> {
        let mut records = self.records.lock();
        let replaced = records
            .iter()
            .position(|r| r.addr == addr)
            .map(|idx| records.remove(idx));
        records.push(ConnectionRecord {
            addr,
            link,
            remote_name: None,
        });
        replaced
    }

    /// Remove a connection. Removing an absent address is a no-op.
    pub fn remove(&self, addr: &SocketAddr) -> Option<ConnectionRecord> {
        let mut records = self.records.lock();
        let idx = records.iter().position(|r| &r.addr == addr)?;
        Some(records.remove(idx))
    }

    /// Record the name a connection introduced itself with.
    /// Returns `false` if the connection is no longer registered.
    pub fn rename(&self, addr: &SocketAddr, name: &str) -> bool {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| &r.addr == addr) {
            Some(record) => {
                record.remote_name = Some(name.to_string());
                true
            }
            None => false,
        }
    }

    pub fn remote_name(&self, addr: &SocketAddr) -> Option<String> {
        self.records
            .lock()
            .iter()
            .find(|r| &r.addr == addr)
            .and_then(|r| r.remote_name.clone())
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.records.lock().iter().any(|r| &r.addr == addr)
    }

    /// Point-in-time copy of every link, in registration order.
    pub fn snapshot(&self) -> Vec<(SocketAddr, Arc<dyn FrameSink>)> {
        self.records
            .lock()
            .iter()
            .map(|r| (r.addr, Arc::clone(&r.link)))
            .collect()
    }

    /// Point-in-time copy of every record, for display.
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.records.lock().clone()
    }

    /// Remove and return every record.
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
