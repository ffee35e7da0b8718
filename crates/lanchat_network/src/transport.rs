//! Framed TCP links to peers.
//!
//! A connection is split in two: the read half goes to a relay read loop
//! wrapped in a [`FrameReader`], the write half becomes a [`TcpLink`] stored in
//! the connection registry. Writers go through the [`FrameSink`] trait so the
//! registry and relay never depend on a concrete socket type.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::codec::{self, FrameReader};
use crate::error::NetworkError;
use crate::message::Envelope;

/// The write side of a registered connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one complete frame. Frames from concurrent callers never interleave.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), NetworkError>;

    /// Shut the link down. Errors from an already-closed socket are ignored.
    async fn close(&self);
}

/// Encode and send an envelope over any sink.
pub async fn send_envelope(sink: &dyn FrameSink, envelope: &Envelope) -> Result<(), NetworkError> {
    let frame = codec::encode_frame(envelope)?;
    sink.send_frame(&frame).await
}

/// Reader half of a TCP connection.
pub type TcpFrameReader = FrameReader<BufReader<OwnedReadHalf>>;

/// Writer half of a TCP connection.
pub struct TcpLink {
    peer_addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    write_timeout: Duration,
}

impl TcpLink {
    pub fn new(peer_addr: SocketAddr, writer: OwnedWriteHalf, write_timeout: Duration) -> Self {
        Self {
            peer_addr,
            writer: Mutex::new(Some(writer)),
            write_timeout,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl FrameSink for TcpLink {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), NetworkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            NetworkError::Transport(format!("Link to {} is closed", self.peer_addr))
        })?;

        match tokio::time::timeout(self.write_timeout, writer.write_all(frame)).await {
            Ok(Ok(())) => {
                trace!("Sent {} bytes to {}", frame.len(), self.peer_addr);
                Ok(())
            }
            Ok(Err(e)) => Err(NetworkError::Transport(format!(
                "Send to {} failed: {e}",
                self.peer_addr
            ))),
            Err(_) => Err(NetworkError::Timeout(self.write_timeout)),
        }
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of link to {} reported: {e}", self.peer_addr);
            }
        }
    }
}

/// Split an established stream into a frame reader and a registry link.
pub fn split_stream(
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_frame_bytes: usize,
    write_timeout: Duration,
) -> (TcpFrameReader, TcpLink) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {peer_addr}: {e}");
    }
    let (read_half, write_half) = stream.into_split();
    let reader = FrameReader::new(BufReader::new(read_half), max_frame_bytes);
    let link = TcpLink::new(peer_addr, write_half, write_timeout);
    (reader, link)
}

/// Connect to a host's chat port.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetworkError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::ConnectFailed {
            addr,
            reason: e.to_string(),
        }),
        Err(_) => Err(NetworkError::ConnectFailed {
            addr,
            reason: format!("no answer within {timeout:?}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
