//! # Wisp Tunnel
//!
//! An encrypted SOCKS5-over-WebSocket tunnel.
//!
//! The local side (`wisp-local`) exposes a SOCKS5 endpoint to applications,
//! wraps each proxied TCP connection in a stream cipher and carries it as
//! binary WebSocket messages to a remote terminator (`wisp-server`), which
//! decrypts the traffic and re-emits it as a plain TCP connection to the
//! real destination. The outbound WebSocket leg can optionally be routed
//! through a classic HTTP forward proxy.
//!
//! ```text
//! application ──> wisp-local (SOCKS5) ══ encrypted WebSocket ══> wisp-server ──> destination
//! ```
//!
//! Each accepted connection on either side is an independent session with
//! its own cipher state and its own early-data queue; sessions share nothing
//! but the read-only endpoint list and the observability counters.

pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod local;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

use std::time::Duration;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Read buffer size for both relay legs
pub const RELAY_BUFFER_SIZE: usize = 16384;

/// Interval between keepalive pings sent by the local side while relaying
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(50);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,
}
