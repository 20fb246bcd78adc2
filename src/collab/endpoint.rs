//! One live connection owned by a proxy.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

use super::frame::{FrameError, FrameReader, FrameWriter};
use super::proto::{ProtoEncodeError, WireMessage, encode_message};
use super::transport::{Connection, ConnectionCloser};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("endpoint closed")]
    Closed,
    #[error("encode error: {0}")]
    Encode(#[from] ProtoEncodeError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

pub type EndpointReader = FrameReader<Box<dyn Read + Send>>;

/// Write half of a connection plus its collision magic number.
///
/// Writes are serialized through an internal lock; closing is idempotent and
/// unblocks the matching reader.
pub struct Endpoint {
    id: u64,
    magic: u64,
    direction: Direction,
    peer: Option<SocketAddr>,
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    closer: Box<dyn ConnectionCloser>,
    active: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("magic", &self.magic)
            .field("direction", &self.direction)
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Endpoint {
    /// Split a connection into an endpoint and the reader half that the
    /// receiving task owns.
    pub fn from_connection(
        connection: Connection,
        magic: u64,
        direction: Direction,
        max_frame_bytes: usize,
    ) -> (Self, EndpointReader) {
        let Connection {
            reader,
            writer,
            closer,
            peer,
        } = connection;
        let endpoint = Self::new(writer, closer, peer, magic, direction, max_frame_bytes);
        (endpoint, FrameReader::new(reader, max_frame_bytes))
    }

    /// Build an endpoint from the halves left after the reader was split off,
    /// e.g. once the peer's handshake revealed the magic number.
    pub fn new(
        writer: Box<dyn Write + Send>,
        closer: Box<dyn ConnectionCloser>,
        peer: Option<SocketAddr>,
        magic: u64,
        direction: Direction,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            magic,
            direction,
            peer,
            writer: Mutex::new(FrameWriter::new(writer, max_frame_bytes)),
            closer,
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn send(&self, message: &WireMessage) -> Result<(), SendError> {
        if !self.is_active() {
            return Err(SendError::Closed);
        }
        let bytes = encode_message(message)?;
        let mut writer = self.writer.lock().expect("endpoint writer lock poisoned");
        writer.write_frame(&bytes)?;
        Ok(())
    }

    /// Returns `true` for the call that actually closed the endpoint.
    pub fn close(&self) -> bool {
        if self.active.swap(false, Ordering::AcqRel) {
            self.closer.close();
            tracing::debug!(endpoint = self.id, magic = self.magic, "endpoint closed");
            true
        } else {
            false
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
