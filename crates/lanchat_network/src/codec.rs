//! Newline-delimited JSON framing for TCP links.
//!
//! A byte stream carries no message boundaries, so every envelope is written
//! as one compact JSON line. [`FrameReader`] buffers whatever arrives until a
//! full line is available. Its read path only awaits `fill_buf`, so a frame
//! read can be abandoned by a timeout without losing the bytes already
//! received.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::NetworkError;
use crate::message::Envelope;

const DELIMITER: u8 = b'\n';

/// Encode an envelope as a single newline-terminated frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, NetworkError> {
    let mut frame = serde_json::to_vec(envelope)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// Decode one frame (with or without its trailing newline).
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, NetworkError> {
    let body = frame.strip_suffix(&[DELIMITER]).unwrap_or(frame);
    let body = body.strip_suffix(b"\r").unwrap_or(body);
    Ok(Envelope::from_slice(body)?)
}

/// Reassembles frames from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    pending: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Read the next complete frame, newline included.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in the
    /// middle of a frame is a transport error.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let partial = self.pending.len();
                self.pending.clear();
                return Err(NetworkError::Transport(format!(
                    "Stream closed with {partial} bytes of an unfinished frame"
                )));
            }

            let (consumed, complete) = match available.iter().position(|b| *b == DELIMITER) {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            };
            self.pending.extend_from_slice(&available[..consumed]);
            self.inner.consume(consumed);

            if self.pending.len() > self.max_frame_bytes {
                let size = self.pending.len();
                self.pending.clear();
                return Err(NetworkError::FrameTooLarge {
                    size,
                    limit: self.max_frame_bytes,
                });
            }

            if complete {
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
        }
    }

    /// Number of buffered bytes belonging to an unfinished frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
