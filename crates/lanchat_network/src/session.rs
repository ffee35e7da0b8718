//! Chat sessions — the host and client lifecycles.
//!
//! A session moves `Idle -> Running -> Stopped` exactly once. Every spawned
//! task observes the same `watch` flag; `stop()` flips it, closes every
//! registered link, and waits for the tasks to finish before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::contacts::ContactDirectory;
use crate::discovery::{self, Announcer, DiscoveredHost};
use crate::error::NetworkError;
use crate::events::{EventSink, SessionEvent};
use crate::history::MessageHistory;
use crate::identity::PeerIdentity;
use crate::protocol::{Handshake, Role};
use crate::registry::ConnectionRegistry;
use crate::relay::{ReadLoopExit, RelayEngine};
use crate::transport;

/// Everything a session needs from the application.
///
/// The directory and history are shared so they outlive any one session.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: PeerIdentity,
    pub config: NetworkConfig,
    pub contacts: Arc<ContactDirectory>,
    pub history: Arc<MessageHistory>,
    pub events: EventSink,
}

impl SessionContext {
    pub fn new(identity: PeerIdentity, config: NetworkConfig) -> Self {
        Self {
            identity,
            config,
            contacts: Arc::new(ContactDirectory::new()),
            history: Arc::new(MessageHistory::new()),
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    fn engine(&self, role: Role) -> Arc<RelayEngine> {
        Arc::new(RelayEngine::new(
            role,
            self.identity.clone(),
            Arc::new(ConnectionRegistry::new()),
            Arc::clone(&self.contacts),
            Arc::clone(&self.history),
            self.events.clone(),
        ))
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopped,
}

/// Behaviour shared by both roles.
#[async_trait]
pub trait Session: Send + Sync {
    fn role(&self) -> Role;

    /// Bring the session up. Starting a running session is a no-op; a
    /// stopped session cannot be restarted.
    async fn start(&mut self) -> Result<(), NetworkError>;

    /// Tear the session down and wait for its tasks. Idempotent.
    async fn stop(&mut self);

    /// Send a locally composed line to every connection. Returns how many
    /// connections accepted the frame.
    async fn send_chat(&self, content: &str) -> Result<usize, NetworkError>;

    fn is_running(&self) -> bool;

    fn lifecycle(&self) -> LifecycleState;

    /// Resolves to `true` once the session has been told to stop, or (for a
    /// client) once the host connection ends.
    fn shutdown_signal(&self) -> watch::Receiver<bool>;

    /// Wait until [`shutdown_signal`](Self::shutdown_signal) turns `true`.
    async fn wait_stopped(&self) {
        let mut signal = self.shutdown_signal();
        // A closed channel means the session is gone, which is also stopped.
        let _ = signal.wait_for(|stopped| *stopped).await;
    }
}

fn shutdown_channel() -> Arc<watch::Sender<bool>> {
    let (tx, _rx) = watch::channel(false);
    Arc::new(tx)
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Accepts clients, relays their chat, and announces itself on the LAN.
pub struct HostSession {
    ctx: SessionContext,
    state: LifecycleState,
    shutdown: Arc<watch::Sender<bool>>,
    engine: Arc<RelayEngine>,
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    readers: Arc<Mutex<Vec<JoinHandle<ReadLoopExit>>>>,
    announcer: Option<JoinHandle<()>>,
}

impl HostSession {
    pub fn new(ctx: SessionContext) -> Self {
        let engine = ctx.engine(Role::Host);
        Self {
            ctx,
            state: LifecycleState::Idle,
            shutdown: shutdown_channel(),
            engine,
            listener: None,
            local_addr: None,
            accept_task: None,
            readers: Arc::new(Mutex::new(Vec::new())),
            announcer: None,
        }
    }

    /// The bound chat address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.engine.registry()
    }

    /// Whether the discovery announcer is still broadcasting.
    pub fn is_announcing(&self) -> bool {
        self.announcer.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn spawn_accept_loop(&self, listener: Arc<TcpListener>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let readers = Arc::clone(&self.readers);
        let shutdown = self.shutdown.subscribe();
        let config = self.ctx.config.clone();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let (stream, addr) =
                    match tokio::time::timeout(config.poll_interval, listener.accept()).await {
                        Err(_) => continue,
                        Ok(Ok(accepted)) => accepted,
                        Ok(Err(e)) => {
                            if *shutdown.borrow() {
                                break;
                            }
                            warn!("Accept failed: {e}");
                            tokio::time::sleep(config.poll_interval).await;
                            continue;
                        }
                    };

                info!("Accepted connection from {addr}");
                let (reader, link) =
                    transport::split_stream(stream, addr, config.max_frame_bytes, config.write_timeout);
                match engine
                    .attach(
                        addr,
                        reader,
                        Arc::new(link),
                        Handshake::host(),
                        shutdown.clone(),
                        config.poll_interval,
                    )
                    .await
                {
                    Ok(handle) => {
                        let mut readers = readers.lock();
                        readers.retain(|h| !h.is_finished());
                        readers.push(handle);
                    }
                    Err(e) => warn!("Could not greet {addr}: {e}"),
                }
            }
            debug!("Accept loop stopped");
        })
    }
}

#[async_trait]
impl Session for HostSession {
    fn role(&self) -> Role {
        Role::Host
    }

    async fn start(&mut self) -> Result<(), NetworkError> {
        match self.state {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Stopped => return Err(NetworkError::SessionClosed),
            LifecycleState::Idle => {}
        }

        let host_ip = match self.ctx.config.host_ip {
            Some(ip) => ip,
            None => discovery::local_ipv4().await?,
        };
        let bind_addr = SocketAddr::from((host_ip, self.ctx.config.chat_port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| NetworkError::BindFailed {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        self.accept_task = Some(self.spawn_accept_loop(Arc::clone(&listener)));
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.state = LifecycleState::Running;

        info!("Hosting chat on {local_addr} as '{}'", self.ctx.identity.name);
        self.ctx.events.emit(SessionEvent::Hosting {
            addr: local_addr,
            host_id: self.ctx.identity.id.clone(),
        });

        let announcer = Announcer::new(
            &self.ctx.identity,
            host_ip,
            local_addr.port(),
            self.ctx.config.discovery_port,
            self.ctx.config.discovery_target,
            self.ctx.config.announce_interval,
        );
        let target = announcer.target;
        match announcer.spawn(self.shutdown.subscribe()).await {
            Ok(handle) => {
                self.announcer = Some(handle);
                self.ctx.events.emit(SessionEvent::Announcing { target });
            }
            Err(e) => warn!("Discovery announcements disabled: {e}"),
        }

        Ok(())
    }

    async fn stop(&mut self) {
        match self.state {
            LifecycleState::Stopped => return,
            LifecycleState::Idle => {
                self.state = LifecycleState::Stopped;
                return;
            }
            LifecycleState::Running => {}
        }

        info!("Stopping host session");
        self.shutdown.send_replace(true);

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept task ended abnormally: {e}");
            }
        }

        for record in self.engine.registry().drain() {
            record.link.close().await;
        }

        let readers = std::mem::take(&mut *self.readers.lock());
        for result in join_all(readers).await {
            if let Err(e) = result {
                warn!("Read loop ended abnormally: {e}");
            }
        }

        if let Some(task) = self.announcer.take() {
            if let Err(e) = task.await {
                warn!("Announcer ended abnormally: {e}");
            }
        }

        self.listener = None;
        self.state = LifecycleState::Stopped;
        self.ctx.events.emit(SessionEvent::Stopped { role: Role::Host });
        info!("Host session stopped");
    }

    async fn send_chat(&self, content: &str) -> Result<usize, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        self.engine.send_local(content).await
    }

    fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    fn lifecycle(&self) -> LifecycleState {
        self.state
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A single connection to a host.
pub struct ClientSession {
    ctx: SessionContext,
    host_addr: SocketAddr,
    state: LifecycleState,
    shutdown: Arc<watch::Sender<bool>>,
    engine: Arc<RelayEngine>,
    reader: Option<JoinHandle<ReadLoopExit>>,
}

impl ClientSession {
    pub fn new(ctx: SessionContext, host_addr: SocketAddr) -> Self {
        let engine = ctx.engine(Role::Client);
        Self {
            ctx,
            host_addr,
            state: LifecycleState::Idle,
            shutdown: shutdown_channel(),
            engine,
            reader: None,
        }
    }

    /// Join a host found by a discovery scan. The announced name is recorded
    /// so the host's chat lines display under it.
    pub fn for_host(ctx: SessionContext, host: &DiscoveredHost) -> Self {
        ctx.contacts.upsert(&host.host_id, &host.host_name);
        Self::new(ctx, host.chat_addr())
    }

    pub fn host_addr(&self) -> SocketAddr {
        self.host_addr
    }
}

#[async_trait]
impl Session for ClientSession {
    fn role(&self) -> Role {
        Role::Client
    }

    async fn start(&mut self) -> Result<(), NetworkError> {
        match self.state {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Stopped => return Err(NetworkError::SessionClosed),
            LifecycleState::Idle => {}
        }

        let config = &self.ctx.config;
        let stream = transport::connect(self.host_addr, config.connect_timeout).await?;
        let (reader, link) = transport::split_stream(
            stream,
            self.host_addr,
            config.max_frame_bytes,
            config.write_timeout,
        );
        let handle = self
            .engine
            .attach(
                self.host_addr,
                reader,
                Arc::new(link),
                Handshake::client(),
                self.shutdown.subscribe(),
                config.poll_interval,
            )
            .await?;

        // Losing the host ends the session from the user's point of view.
        let shutdown = Arc::clone(&self.shutdown);
        self.reader = Some(tokio::spawn(async move {
            let exit = handle.await.unwrap_or(ReadLoopExit::Failed);
            shutdown.send_replace(true);
            exit
        }));
        self.state = LifecycleState::Running;

        info!("Joined host at {}", self.host_addr);
        self.ctx
            .events
            .emit(SessionEvent::JoinedHost { addr: self.host_addr });
        Ok(())
    }

    async fn stop(&mut self) {
        match self.state {
            LifecycleState::Stopped => return,
            LifecycleState::Idle => {
                self.state = LifecycleState::Stopped;
                return;
            }
            LifecycleState::Running => {}
        }

        info!("Leaving host {}", self.host_addr);
        self.shutdown.send_replace(true);

        for record in self.engine.registry().drain() {
            record.link.close().await;
        }

        if let Some(task) = self.reader.take() {
            match task.await {
                Ok(exit) => debug!("Client read loop ended: {exit:?}"),
                Err(e) => warn!("Client read loop ended abnormally: {e}"),
            }
        }

        self.state = LifecycleState::Stopped;
        self.ctx
            .events
            .emit(SessionEvent::Stopped { role: Role::Client });
    }

    async fn send_chat(&self, content: &str) -> Result<usize, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        self.engine.send_local(content).await
    }

    fn is_running(&self) -> bool {
        self.state == LifecycleState::Running && !*self.shutdown.borrow()
    }

    fn lifecycle(&self) -> LifecycleState {
        self.state
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
