//! Relay engine — per-connection read loops and fan-out broadcast.
//!
//! Host and client sessions share one engine. Each registered connection
//! gets a read loop that decodes frames, feeds them through the
//! connection's [`Handshake`], updates the contact directory and history,
//! and (host role only) re-broadcasts chat frames to every other peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::AsyncBufRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, FrameReader};
use crate::contacts::{ContactDirectory, ContactUpdate};
use crate::error::NetworkError;
use crate::events::{EventSink, SessionEvent};
use crate::history::{ALL_RECIPIENTS, MessageHistory};
use crate::identity::{PeerId, PeerIdentity, host_placeholder, peer_placeholder};
use crate::message::Envelope;
use crate::protocol::{Handshake, Inbound, Role};
use crate::registry::ConnectionRegistry;
use crate::transport::FrameSink;

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLoopExit {
    /// The session's stop flag was observed.
    Shutdown,
    /// The remote closed the stream.
    Closed,
    /// A transport or protocol error ended the connection.
    Failed,
}

/// Shared relay state for one session.
pub struct RelayEngine {
    role: Role,
    local: PeerIdentity,
    registry: Arc<ConnectionRegistry>,
    contacts: Arc<ContactDirectory>,
    history: Arc<MessageHistory>,
    events: EventSink,
}

impl RelayEngine {
    pub fn new(
        role: Role,
        local: PeerIdentity,
        registry: Arc<ConnectionRegistry>,
        contacts: Arc<ContactDirectory>,
        history: Arc<MessageHistory>,
        events: EventSink,
    ) -> Self {
        Self {
            role,
            local,
            registry,
            contacts,
            history,
            events,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn contacts(&self) -> &Arc<ContactDirectory> {
        &self.contacts
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Register a connection, send this side's opening frame, and spawn its
    /// read loop.
    pub async fn attach<R>(
        self: &Arc<Self>,
        addr: SocketAddr,
        reader: FrameReader<R>,
        link: Arc<dyn FrameSink>,
        mut handshake: Handshake,
        shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) -> Result<JoinHandle<ReadLoopExit>, NetworkError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let opening = codec::encode_frame(&handshake.opening(&self.local))?;

        self.registry.insert(addr, Arc::clone(&link));
        if self.role == Role::Host {
            self.events.emit(SessionEvent::PeerConnected { addr });
        }

        if let Err(e) = link.send_frame(&opening).await {
            warn!("Handshake with {addr} failed: {e}");
            self.drop_connection(&addr).await;
            return Err(e);
        }
        debug!("Handshake opened with {addr} as {}", self.role.as_str());

        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine
                .read_loop(addr, reader, handshake, shutdown, poll_interval)
                .await
        }))
    }

    /// Read frames from one connection until it closes, fails, or the
    /// session stops. The connection is removed from the registry on exit.
    pub async fn read_loop<R>(
        &self,
        addr: SocketAddr,
        mut reader: FrameReader<R>,
        mut handshake: Handshake,
        shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) -> ReadLoopExit
    where
        R: AsyncBufRead + Unpin,
    {
        let exit = loop {
            if *shutdown.borrow() {
                break ReadLoopExit::Shutdown;
            }

            let frame = match tokio::time::timeout(poll_interval, reader.next_frame()).await {
                Err(_) => continue,
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    info!("Connection {addr} closed by remote");
                    break ReadLoopExit::Closed;
                }
                Ok(Err(e)) => {
                    if !*shutdown.borrow() {
                        warn!("Dropping {addr}: {e}");
                    }
                    break ReadLoopExit::Failed;
                }
            };

            let inbound = match codec::decode_frame(&frame).and_then(|env| handshake.accept(env)) {
                Ok(inbound) => inbound,
                Err(e) => {
                    warn!("Protocol error from {addr}, dropping connection: {e}");
                    break ReadLoopExit::Failed;
                }
            };

            self.handle_inbound(addr, inbound, &frame).await;
        };

        self.drop_connection(&addr).await;
        exit
    }

    /// Apply one decoded envelope. Returns how many peers a chat frame was
    /// relayed to.
    pub async fn handle_inbound(&self, from: SocketAddr, inbound: Inbound, frame: &[u8]) -> usize {
        match inbound {
            Inbound::Introduced { id, name } => {
                self.registry.rename(&from, &name);
                match self.contacts.upsert(&id, &name) {
                    ContactUpdate::Added => {
                        info!("New contact '{name}' ({id})");
                        self.events.emit(SessionEvent::ContactAdded {
                            id: id.clone(),
                            name: name.clone(),
                        });
                    }
                    ContactUpdate::Renamed { previous } => {
                        debug!("Contact {id} renamed from '{previous}' to '{name}'");
                    }
                    ContactUpdate::Unchanged => {}
                }
                self.events.emit(SessionEvent::PeerIntroduced {
                    addr: from,
                    id,
                    name,
                });
                0
            }
            Inbound::HostIdentified { host_id } => {
                let name = host_placeholder(&host_id);
                if self.contacts.insert_if_absent(&host_id, &name) {
                    self.events.emit(SessionEvent::ContactAdded { id: host_id, name });
                }
                0
            }
            Inbound::Chat {
                sender_id,
                content,
                timestamp,
            } => {
                let sender_name = self.resolve_sender(&sender_id, &from);
                if self.contacts.insert_if_absent(&sender_id, &sender_name) {
                    self.events.emit(SessionEvent::ContactAdded {
                        id: sender_id.clone(),
                        name: sender_name.clone(),
                    });
                }

                self.history
                    .record_received(&sender_id, &self.local.id, &content);
                self.events.emit(SessionEvent::Chat {
                    sender_id,
                    sender_name,
                    content,
                    is_local: false,
                    timestamp,
                });

                match self.role {
                    Role::Host => self.broadcast(frame, Some(from)).await,
                    Role::Client => 0,
                }
            }
        }
    }

    /// Display name for a chat sender: directory first, then (host only) the
    /// name the sending connection introduced itself with, then a placeholder.
    pub fn resolve_sender(&self, sender_id: &PeerId, from: &SocketAddr) -> String {
        if let Some(name) = self.contacts.resolve(sender_id) {
            return name;
        }
        if self.role == Role::Host {
            if let Some(name) = self.registry.remote_name(from) {
                return name;
            }
        }
        peer_placeholder(sender_id)
    }

    /// Write `frame` to every registered connection except `exclude`.
    ///
    /// Works from a registry snapshot. A peer whose write fails is removed and
    /// the rest still receive the frame. Returns the number of successful
    /// deliveries.
    pub async fn broadcast(&self, frame: &[u8], exclude: Option<SocketAddr>) -> usize {
        let targets: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|(addr, _)| Some(*addr) != exclude)
            .collect();

        let results = join_all(targets.iter().map(|(addr, link)| async move {
            (*addr, link.send_frame(frame).await)
        }))
        .await;

        let mut delivered = 0;
        for (addr, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Relay to {addr} failed, removing peer: {e}");
                    self.drop_connection(&addr).await;
                }
            }
        }
        delivered
    }

    /// Compose a chat line locally and send it to every registered connection.
    ///
    /// This does not go through the received-message path: nothing is
    /// excluded and nothing is re-relayed.
    pub async fn send_local(&self, content: &str) -> Result<usize, NetworkError> {
        let envelope = Envelope::chat(self.local.id.clone(), content);
        let frame = codec::encode_frame(&envelope)?;

        let recipient = match self.role {
            Role::Host => ALL_RECIPIENTS.to_string(),
            Role::Client => self
                .registry
                .snapshot()
                .first()
                .map(|(addr, _)| addr.to_string())
                .unwrap_or_else(|| ALL_RECIPIENTS.to_string()),
        };
        self.history.record_local(&self.local.id, &recipient, content);

        if let Envelope::ChatMessage { timestamp, .. } = &envelope {
            self.events.emit(SessionEvent::Chat {
                sender_id: self.local.id.clone(),
                sender_name: self.local.name.clone(),
                content: content.to_string(),
                is_local: true,
                timestamp: *timestamp,
            });
        }

        Ok(self.broadcast(&frame, None).await)
    }

    /// Remove a connection and close its link. Only the call that actually
    /// removes the record closes it and reports the disconnect.
    pub async fn drop_connection(&self, addr: &SocketAddr) -> bool {
        match self.registry.remove(addr) {
            Some(record) => {
                record.link.close().await;
                info!(
                    "Peer {} disconnected",
                    record.remote_name.as_deref().unwrap_or(&addr.to_string())
                );
                self.events.emit(SessionEvent::PeerDisconnected {
                    addr: *addr,
                    name: record.remote_name,
                });
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::BufReader;

    use super::*;
    use crate::events::EventReceiver;

    /// Records every frame; optionally fails every write.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Vec<u8>>>,
        fail: bool,
        closes: AtomicUsize,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().clone()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: &[u8]) -> Result<(), NetworkError> {
            if self.fail {
                return Err(NetworkError::Transport("broken pipe".into()));
            }
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn engine(role: Role) -> (Arc<RelayEngine>, EventReceiver) {
        let (events, rx) = EventSink::channel();
        let engine = RelayEngine::new(
            role,
            PeerIdentity {
                id: PeerId::from_string("host-id-0001"),
                name: "Hana".to_string(),
            },
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ContactDirectory::new()),
            Arc::new(MessageHistory::new()),
            events,
        );
        (Arc::new(engine), rx)
    }

    fn chat_frame(sender: &str, content: &str) -> (Inbound, Vec<u8>) {
        let envelope = Envelope::chat(PeerId::from_string(sender), content);
        let frame = codec::encode_frame(&envelope).unwrap();
        let inbound = Handshake::host().accept(envelope).unwrap();
        (inbound, frame)
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (engine, _rx) = engine(Role::Host);
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let c = Arc::new(RecordingSink::default());
        engine.registry().insert(addr(1), a.clone());
        engine.registry().insert(addr(2), b.clone());
        engine.registry().insert(addr(3), c.clone());

        let (inbound, frame) = chat_frame("peer-a", "hello");
        let relayed = engine.handle_inbound(addr(1), inbound, &frame).await;

        assert_eq!(relayed, 2);
        assert!(a.frames().is_empty());
        assert_eq!(b.frames(), vec![frame.clone()]);
        assert_eq!(c.frames(), vec![frame]);
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let (engine, mut rx) = engine(Role::Host);
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::failing());
        let c = Arc::new(RecordingSink::default());
        engine.registry().insert(addr(1), a.clone());
        engine.registry().insert(addr(2), b.clone());
        engine.registry().insert(addr(3), c.clone());

        let (inbound, frame) = chat_frame("peer-a", "hello");
        let relayed = engine.handle_inbound(addr(1), inbound, &frame).await;

        assert_eq!(relayed, 1);
        assert_eq!(c.frames(), vec![frame]);
        assert!(!engine.registry().contains(&addr(2)));
        assert_eq!(engine.registry().len(), 2);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);

        // A second removal attempt is a no-op.
        assert!(!engine.drop_connection(&addr(2)).await);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);

        let mut disconnects = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::PeerDisconnected { addr: a, .. } if a == addr(2)) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_client_does_not_relay() {
        let (engine, _rx) = engine(Role::Client);
        let host = Arc::new(RecordingSink::default());
        engine.registry().insert(addr(1), host.clone());

        let (inbound, frame) = chat_frame("someone", "hi");
        assert_eq!(engine.handle_inbound(addr(1), inbound, &frame).await, 0);
        assert!(host.frames().is_empty());
    }

    #[tokio::test]
    async fn test_name_resolution_order() {
        let (engine, _rx) = engine(Role::Host);
        engine
            .registry()
            .insert(addr(1), Arc::new(RecordingSink::default()));
        let id = PeerId::from_string("abcdef0123456789");

        assert_eq!(engine.resolve_sender(&id, &addr(1)), "Peer (abcdef01)");

        engine.registry().rename(&addr(1), "Sam");
        assert_eq!(engine.resolve_sender(&id, &addr(1)), "Sam");

        engine.contacts().upsert(&id, "Samuel");
        assert_eq!(engine.resolve_sender(&id, &addr(1)), "Samuel");
    }

    #[tokio::test]
    async fn test_client_ignores_connection_name_for_relayed_senders() {
        let (engine, _rx) = engine(Role::Client);
        engine
            .registry()
            .insert(addr(1), Arc::new(RecordingSink::default()));
        engine.registry().rename(&addr(1), "Hana");

        let other = PeerId::from_string("c1c1c1c1-rest");
        assert_eq!(engine.resolve_sender(&other, &addr(1)), "Peer (c1c1c1c1)");
    }

    #[tokio::test]
    async fn test_intro_updates_directory_and_registry() {
        let (engine, mut rx) = engine(Role::Host);
        engine
            .registry()
            .insert(addr(1), Arc::new(RecordingSink::default()));
        let sam = PeerId::from_string("sam-id");

        for name in ["Sam", "Sam", "Samuel"] {
            let inbound = Inbound::Introduced {
                id: sam.clone(),
                name: name.to_string(),
            };
            engine.handle_inbound(addr(1), inbound, b"").await;
        }

        assert_eq!(engine.contacts().len(), 1);
        assert_eq!(engine.contacts().resolve(&sam).as_deref(), Some("Samuel"));
        assert_eq!(engine.registry().remote_name(&addr(1)).as_deref(), Some("Samuel"));

        let added = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, SessionEvent::ContactAdded { .. }))
            .count();
        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn test_host_placeholder_does_not_override_discovered_name() {
        let (engine, _rx) = engine(Role::Client);
        let host = PeerId::from_string("host-xyz-123");
        engine.contacts().upsert(&host, "Hana");

        engine
            .handle_inbound(addr(1), Inbound::HostIdentified { host_id: host.clone() }, b"")
            .await;
        assert_eq!(engine.contacts().resolve(&host).as_deref(), Some("Hana"));

        let unknown = PeerId::from_string("other-host-1");
        engine
            .handle_inbound(addr(1), Inbound::HostIdentified { host_id: unknown.clone() }, b"")
            .await;
        assert_eq!(engine.contacts().resolve(&unknown).as_deref(), Some("Host (other-ho)"));
    }

    #[tokio::test]
    async fn test_send_local_reaches_everyone_and_is_recorded() {
        let (engine, mut rx) = engine(Role::Host);
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        engine.registry().insert(addr(1), a.clone());
        engine.registry().insert(addr(2), b.clone());

        let sent = engine.send_local("hi all").await.unwrap();
        assert_eq!(sent, 2);
        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames().len(), 1);

        let entries = engine.history.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_local);
        assert_eq!(entries[0].recipient, ALL_RECIPIENTS);

        match rx.try_recv().unwrap() {
            SessionEvent::Chat {
                is_local,
                sender_name,
                ..
            } => {
                assert!(is_local);
                assert_eq!(sender_name, "Hana");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_loop_drops_connection_on_protocol_error() {
        let (engine, _rx) = engine(Role::Host);
        engine
            .registry()
            .insert(addr(1), Arc::new(RecordingSink::default()));

        let mut bytes = codec::encode_frame(&Envelope::chat(PeerId::from_string("x"), "ok")).unwrap();
        bytes.extend_from_slice(b"{\"type\":\"mystery\"}\n");
        bytes.extend(codec::encode_frame(&Envelope::chat(PeerId::from_string("x"), "never")).unwrap());

        let reader = FrameReader::new(BufReader::new(std::io::Cursor::new(bytes)), 1024);
        let (_tx, shutdown) = watch::channel(false);
        let exit = engine
            .read_loop(addr(1), reader, Handshake::host(), shutdown, Duration::from_millis(50))
            .await;

        assert_eq!(exit, ReadLoopExit::Failed);
        assert!(engine.registry().is_empty());
        let contents: Vec<String> = engine.history.entries().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_read_loop_accepts_timestamp_without_offset() {
        let (engine, _rx) = engine(Role::Host);
        engine
            .registry()
            .insert(addr(1), Arc::new(RecordingSink::default()));

        let bytes = b"{\"type\":\"chat_message\",\"sender_id\":\"x\",\"content\":\"oi\",\"timestamp\":\"2024-05-01T12:00:00.123456\"}\n".to_vec();
        let reader = FrameReader::new(BufReader::new(std::io::Cursor::new(bytes)), 1024);
        let (_tx, shutdown) = watch::channel(false);
        let exit = engine
            .read_loop(addr(1), reader, Handshake::host(), shutdown, Duration::from_millis(50))
            .await;

        assert_eq!(exit, ReadLoopExit::Closed);
        let entries = engine.history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "oi");
    }

    #[tokio::test]
    async fn test_read_loop_observes_shutdown() {
        let (engine, _rx) = engine(Role::Client);
        engine
            .registry()
            .insert(addr(1), Arc::new(RecordingSink::default()));

        // A stream that never produces data.
        let (_writer, idle) = tokio::io::duplex(64);
        let reader = FrameReader::new(BufReader::new(idle), 1024);
        let (tx, shutdown) = watch::channel(false);

        let engine_clone = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            engine_clone
                .read_loop(addr(1), reader, Handshake::client(), shutdown, Duration::from_millis(20))
                .await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("read loop ignored shutdown")
            .unwrap();
        assert_eq!(exit, ReadLoopExit::Shutdown);
        assert!(engine.registry().is_empty());
    }
}
