//! LAN host discovery via UDP broadcast.
//!
//! A hosting peer runs an [`Announcer`] that periodically broadcasts a
//! `discovery` envelope. A joining peer runs [`scan`] once: it listens for a
//! fixed window, drops its own announcements and duplicates, and returns the
//! hosts in the order they were first heard.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::message::Envelope;

const MAX_DATAGRAM: usize = 4096;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A host found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub host_id: PeerId,
    pub host_ip: Ipv4Addr,
    pub chat_port: u16,
    pub host_name: String,
    /// Source address of the first datagram heard from this host.
    pub source: SocketAddr,
}

impl DiscoveredHost {
    /// The TCP address to connect to.
    pub fn chat_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.host_ip), self.chat_port)
    }
}

/// Outcome of choosing among scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    NotFound,
    Single(DiscoveredHost),
    Multiple(Vec<DiscoveredHost>),
}

/// Apply the auto-connect policy: one result connects, none is "not found",
/// several need the user to pick.
pub fn select_host(mut hosts: Vec<DiscoveredHost>) -> Selection {
    match hosts.len() {
        0 => Selection::NotFound,
        1 => Selection::Single(hosts.remove(0)),
        _ => Selection::Multiple(hosts),
    }
}

/// Subnet broadcast address for `ip`: last octet replaced by 255.
/// Loopback and unspecified addresses fall back to 255.255.255.255.
pub fn broadcast_address(ip: Ipv4Addr) -> Ipv4Addr {
    if ip.is_loopback() || ip.is_unspecified() {
        return Ipv4Addr::BROADCAST;
    }
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// Determine the LAN address of this machine.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address would route to the target.
pub async fn local_ipv4() -> Result<Ipv4Addr, NetworkError> {
    let probe = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| NetworkError::AddressUnavailable(format!("Probe bind failed: {e}")))?;
    probe
        .connect("8.8.8.8:80")
        .await
        .map_err(|e| NetworkError::AddressUnavailable(format!("No route to a LAN: {e}")))?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
        other => Err(NetworkError::AddressUnavailable(format!(
            "Only a degenerate address is available: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Accumulates announcements, keeping the first one heard per host id.
#[derive(Debug)]
pub struct ScanResults {
    self_id: PeerId,
    seen: HashSet<PeerId>,
    hosts: Vec<DiscoveredHost>,
}

impl ScanResults {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            seen: HashSet::new(),
            hosts: Vec::new(),
        }
    }

    /// Offer one datagram. Returns the host if it is new.
    pub fn offer(&mut self, datagram: &[u8], source: SocketAddr) -> Option<&DiscoveredHost> {
        let envelope = match Envelope::from_slice(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Skipping malformed discovery datagram from {source}: {e}");
                return None;
            }
        };

        let kind = envelope.kind();
        let Envelope::Discovery {
            host_ip,
            chat_port,
            host_id,
            host_name,
        } = envelope
        else {
            debug!("Skipping {} datagram from {source}", kind.as_str());
            return None;
        };

        if host_id == self.self_id {
            trace!("Ignoring our own announcement");
            return None;
        }
        if !self.seen.insert(host_id.clone()) {
            return None;
        }

        self.hosts.push(DiscoveredHost {
            host_id,
            host_ip,
            chat_port,
            host_name,
            source,
        });
        self.hosts.last()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn into_hosts(self) -> Vec<DiscoveredHost> {
        self.hosts
    }
}

/// Listen on `discovery_port` for `window` and return the hosts heard.
pub async fn scan(
    discovery_port: u16,
    self_id: &PeerId,
    window: Duration,
) -> Result<Vec<DiscoveredHost>, NetworkError> {
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, discovery_port));
    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
        NetworkError::Discovery(format!("Cannot listen on discovery port {discovery_port}: {e}"))
    })?;
    info!("Scanning for hosts on {bind_addr} for {window:?}");
    scan_socket(&socket, self_id, window).await
}

/// Collect announcements from an already-bound socket until `window` elapses.
pub async fn scan_socket(
    socket: &UdpSocket,
    self_id: &PeerId,
    window: Duration,
) -> Result<Vec<DiscoveredHost>, NetworkError> {
    let mut results = ScanResults::new(self_id.clone());
    let deadline = tokio::time::Instant::now() + window;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok((len, source))) => {
                if let Some(host) = results.offer(&buf[..len], source) {
                    info!(
                        "Found host '{}' at {}:{}",
                        host.host_name, host.host_ip, host.chat_port
                    );
                }
            }
            Ok(Err(e)) => {
                // Windows reports ICMP port-unreachable on UDP reads; keep
                // listening, but back off so a persistent error cannot spin.
                warn!("Discovery recv error: {e}");
                tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + RECV_ERROR_BACKOFF))
                    .await;
            }
        }
    }

    debug!("Scan finished with {} host(s)", results.len());
    Ok(results.into_hosts())
}

// ---------------------------------------------------------------------------
// Announcer
// ---------------------------------------------------------------------------

/// Periodic presence broadcaster for a hosting session.
pub struct Announcer {
    pub target: SocketAddr,
    pub interval: Duration,
    pub announcement: Envelope,
}

impl Announcer {
    /// Announce `identity` hosting at `host_ip:chat_port`.
    ///
    /// The target is `override_target` when given, else the subnet broadcast
    /// address of `host_ip`.
    pub fn new(
        identity: &PeerIdentity,
        host_ip: Ipv4Addr,
        chat_port: u16,
        discovery_port: u16,
        override_target: Option<Ipv4Addr>,
        interval: Duration,
    ) -> Self {
        let target_ip = override_target.unwrap_or_else(|| broadcast_address(host_ip));
        Self {
            target: SocketAddr::from((target_ip, discovery_port)),
            interval,
            announcement: Envelope::discovery(identity, host_ip, chat_port),
        }
    }

    /// Bind the sending socket and spawn the announce loop.
    pub async fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, NetworkError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;
        self.spawn_with(Arc::new(socket), shutdown)
    }

    /// Spawn the announce loop over `sink`.
    ///
    /// The loop sends immediately, then once per interval, until the shutdown
    /// flag turns true. A send error ends the loop; the session keeps running.
    pub fn spawn_with(
        self,
        sink: Arc<dyn DatagramSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, NetworkError> {
        let datagram = self.announcement.to_json()?.into_bytes();
        let target = self.target;
        let interval = self.interval;
        info!("Announcing on {target} every {interval:?}");

        Ok(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match sink.send_datagram(&datagram, target).await {
                    Ok(_) => trace!("Announcement sent to {target}"),
                    Err(e) => {
                        if !*shutdown.borrow() {
                            warn!("Discovery broadcast to {target} failed, announcer stopping: {e}");
                        }
                        break;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Announcer stopped");
        }))
    }
}

/// Outbound side of the announcer.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_datagram(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_datagram(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        self.send_to(datagram, target).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails every send, counting attempts.
    #[derive(Default)]
    struct UnreachableSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DatagramSink for UnreachableSink {
        async fn send_datagram(&self, _: &[u8], _: SocketAddr) -> std::io::Result<usize> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(
                std::io::ErrorKind::NetworkUnreachable,
                "network is unreachable",
            ))
        }
    }

    fn announcement(id: &str, name: &str) -> Vec<u8> {
        let identity = PeerIdentity {
            id: PeerId::from_string(id),
            name: name.to_string(),
        };
        Envelope::discovery(&identity, Ipv4Addr::new(10, 0, 0, 5), 12345)
            .to_json()
            .unwrap()
            .into_bytes()
    }

    fn source() -> SocketAddr {
        "10.0.0.5:50000".parse().unwrap()
    }

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(192, 168, 1, 37)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(broadcast_address(Ipv4Addr::LOCALHOST), Ipv4Addr::BROADCAST);
        assert_eq!(broadcast_address(Ipv4Addr::UNSPECIFIED), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_self_announcements_suppressed() {
        let mut results = ScanResults::new(PeerId::from_string("me"));
        for _ in 0..50 {
            assert!(results.offer(&announcement("me", "Me"), source()).is_none());
        }
        assert!(results.is_empty());
    }

    #[test]
    fn test_dedupe_keeps_first_name() {
        let mut results = ScanResults::new(PeerId::from_string("me"));
        assert!(results.offer(&announcement("h1", "First"), source()).is_some());
        assert!(results.offer(&announcement("h1", "Renamed"), source()).is_none());
        assert!(results.offer(&announcement("h2", "Other"), source()).is_some());
        assert!(results.offer(&announcement("h1", "Again"), source()).is_none());

        let hosts = results.into_hosts();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host_id.as_str(), "h1");
        assert_eq!(hosts[0].host_name, "First");
        assert_eq!(hosts[1].host_id.as_str(), "h2");
    }

    #[test]
    fn test_malformed_and_foreign_datagrams_skipped() {
        let mut results = ScanResults::new(PeerId::from_string("me"));
        assert!(results.offer(b"not json", source()).is_none());
        assert!(results.offer(br#"{"type":"discovery"}"#, source()).is_none());
        let chat = Envelope::chat(PeerId::from_string("x"), "hi").to_json().unwrap();
        assert!(results.offer(chat.as_bytes(), source()).is_none());
        assert!(results.offer(&announcement("h1", "Ok"), source()).is_some());
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_select_host_policy() {
        assert_eq!(select_host(Vec::new()), Selection::NotFound);

        let mut results = ScanResults::new(PeerId::from_string("me"));
        results.offer(&announcement("h1", "One"), source());
        let hosts = results.into_hosts();
        match select_host(hosts.clone()) {
            Selection::Single(host) => {
                assert_eq!(host.host_name, "One");
                assert_eq!(host.chat_addr(), "10.0.0.5:12345".parse().unwrap());
            }
            other => panic!("expected single host, got {other:?}"),
        }

        let mut two = hosts.clone();
        two.push(hosts[0].clone());
        assert!(matches!(select_host(two), Selection::Multiple(h) if h.len() == 2));
    }

    #[tokio::test]
    async fn test_scan_socket_collects_for_window() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(&announcement("me", "Me"), addr).await.unwrap();
        sender.send_to(b"garbage", addr).await.unwrap();
        sender.send_to(&announcement("h1", "Hana"), addr).await.unwrap();
        sender.send_to(&announcement("h1", "Hana2"), addr).await.unwrap();

        let hosts = scan_socket(&listener, &PeerId::from_string("me"), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host_name, "Hana");
    }

    #[tokio::test]
    async fn test_scan_survives_recv_error_until_window_ends() {
        // A connected UDP socket reports the ICMP port-unreachable for its
        // own datagram as a recv error.
        let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(closed_addr).await.unwrap();
        socket.send(b"ping").await.unwrap();

        let window = Duration::from_millis(300);
        let started = tokio::time::Instant::now();
        let hosts = scan_socket(&socket, &PeerId::from_string("me"), window)
            .await
            .unwrap();
        assert!(hosts.is_empty());
        assert!(started.elapsed() >= window);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_announcer_sends_until_shutdown() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let identity = PeerIdentity::generate("announcer");

        let announcer = Announcer::new(
            &identity,
            Ipv4Addr::LOCALHOST,
            4242,
            port,
            Some(Ipv4Addr::LOCALHOST),
            Duration::from_millis(20),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = announcer.spawn(shutdown_rx).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match Envelope::from_slice(&buf[..len]).unwrap() {
            Envelope::Discovery {
                host_id, chat_port, ..
            } => {
                assert_eq!(host_id, identity.id);
                assert_eq!(chat_port, 4242);
            }
            other => panic!("unexpected envelope {other:?}"),
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("announcer did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_announcer_ends_on_send_error() {
        let identity = PeerIdentity::generate("announcer");
        let announcer = Announcer::new(
            &identity,
            Ipv4Addr::LOCALHOST,
            4242,
            9999,
            Some(Ipv4Addr::LOCALHOST),
            Duration::from_millis(20),
        );
        let sink = Arc::new(UnreachableSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = announcer.spawn_with(sink.clone(), shutdown_rx).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("announcer kept running after a send error")
            .unwrap();
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    }
}
