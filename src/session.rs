//! Shared per-connection session model
//!
//! Both sides of the tunnel run the same stage progression — handshake,
//! await-peer, relay — over a [`Session`] record that owns the stage, the
//! early-data queue and the cipher pair. The only cross-session state is a
//! pair of active-connection counters kept purely for logging.

use crate::crypto::{CipherPair, CryptoError};
use crate::protocol::Address;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Session stage, with the wire-era numeric codes kept for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Initial exchange: SOCKS greeting on the local side, first tunnel
    /// frame on the server side
    Handshake,
    /// SOCKS request parsing (local side only)
    Request,
    /// Destination known, waiting for the far leg to open
    AwaitPeer,
    /// Steady-state bidirectional relay
    Relay,
}

impl Stage {
    /// Numeric code matching the historical stage numbering
    pub fn code(&self) -> u8 {
        match self {
            Stage::Handshake => 0,
            Stage::Request => 1,
            Stage::AwaitPeer => 4,
            Stage::Relay => 5,
        }
    }
}

/// FIFO queue of payload chunks received before the far leg was ready.
///
/// Chunks come back out in exact arrival order. The queue is drained once,
/// when the peer becomes ready, and is sealed afterwards; it can never be
/// repopulated.
#[derive(Debug)]
pub struct EarlyData {
    chunks: Option<Vec<Bytes>>,
}

impl EarlyData {
    pub fn new() -> Self {
        Self {
            chunks: Some(Vec::new()),
        }
    }

    /// Append a chunk. Must not be called after [`EarlyData::drain`].
    pub fn push(&mut self, chunk: Bytes) {
        debug_assert!(self.chunks.is_some(), "early data pushed after drain");
        if let Some(chunks) = &mut self.chunks {
            chunks.push(chunk);
        }
    }

    /// Take all buffered chunks in arrival order and seal the queue.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.chunks.take().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.as_ref().map(Vec::is_empty).unwrap_or(true)
    }
}

/// One tunnel session, created per accepted connection on either side
pub struct Session {
    stage: Stage,
    early: EarlyData,
    cipher: CipherPair,
    dest: Option<Address>,
}

impl Session {
    pub fn new(cipher: CipherPair) -> Self {
        Self {
            stage: Stage::Handshake,
            early: EarlyData::new(),
            cipher,
            dest: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, stage: Stage) {
        debug_assert!(stage.code() > self.stage.code());
        debug!(prev = self.stage.code(), next = stage.code(), "stage advance");
        self.stage = stage;
    }

    /// Record the resolved destination
    pub fn set_dest(&mut self, dest: Address) {
        self.dest = Some(dest);
    }

    pub fn dest(&self) -> Option<&Address> {
        self.dest.as_ref()
    }

    /// Queue payload bytes that arrived before the far leg opened
    pub fn push_early(&mut self, chunk: Bytes) {
        self.early.push(chunk);
    }

    /// Hand out the buffered chunks for the one-time flush to the newly
    /// ready peer
    pub fn drain_early(&mut self) -> Vec<Bytes> {
        self.early.drain()
    }

    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.encrypt(data)
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.decrypt(data)
    }
}

static LOCAL_ACTIVE: AtomicUsize = AtomicUsize::new(0);
static SERVER_ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// Which listener a session belongs to
#[derive(Debug, Clone, Copy)]
pub enum Side {
    Local,
    Server,
}

impl Side {
    fn counter(&self) -> &'static AtomicUsize {
        match self {
            Side::Local => &LOCAL_ACTIVE,
            Side::Server => &SERVER_ACTIVE,
        }
    }
}

/// RAII handle around the per-side active-session counter
pub struct SessionGuard {
    side: Side,
}

impl SessionGuard {
    pub fn enter(side: Side) -> Self {
        let count = side.counter().fetch_add(1, Ordering::Relaxed) + 1;
        debug!(?side, "concurrent connections: {}", count);
        Self { side }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let count = self.side.counter().fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(side = ?self.side, "concurrent connections: {}", count);
    }
}

/// Active sessions on one side, for observability only
pub fn active_sessions(side: Side) -> usize {
    side.counter().load(Ordering::Relaxed)
}
