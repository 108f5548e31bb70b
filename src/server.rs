//! Tunnel terminator
//!
//! Accepts WebSocket sessions, decrypts the leading address frame, opens
//! the real TCP connection to the decoded destination and relays traffic
//! between the two legs. Tunnel messages arriving before the real
//! connection is up are decrypted and queued in arrival order. The server
//! answers keepalive pings with pongs and never initiates them.

use crate::config::ServerConfig;
use crate::crypto::CipherPair;
use crate::protocol::{self, ProtocolError};
use crate::session::{Session, SessionGuard, Side, Stage};
use crate::{Error, RELAY_BUFFER_SIZE};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// The tunnel-side listener
pub struct ServerNode {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl ServerNode {
    /// Bind the tunnel listener. A bind failure is fatal to the process.
    pub async fn bind(config: ServerConfig) -> crate::Result<Self> {
        let listener =
            TcpListener::bind((config.local_address.as_str(), config.remote_port)).await?;
        info!("tunnel server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel connections forever; a malformed or failing session is
    /// torn down and logged without affecting the listener
    pub async fn run(self) -> crate::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("tunnel connection from {}", peer_addr);

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                let _guard = SessionGuard::enter(Side::Server);
                if let Err(e) = handle_connection(stream, config).await {
                    debug!("tunnel session ended: {}", e);
                }
            });
        }
    }
}

/// Drive one tunnel session from the WebSocket handshake to teardown
async fn handle_connection(stream: TcpStream, config: Arc<ServerConfig>) -> crate::Result<()> {
    let mut ws = accept_async(stream).await?;
    // the server side does not recognize the legacy "table" keyword
    let cipher = CipherPair::new(&config.password, &config.method, false)?;
    let mut session = Session::new(cipher);
    let deadline = sleep(config.timeout);
    tokio::pin!(deadline);

    // the first binary message carries the address frame
    let first = loop {
        tokio::select! {
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(Message::Ping(payload))) => ws.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = &mut deadline => return Err(Error::Timeout),
        }
    };

    let plain = session.decrypt(&first)?;
    let (dest, header_len) = match protocol::decode_address(&plain, 0) {
        Ok(parsed) => parsed,
        Err(e @ ProtocolError::UnsupportedAddressType(_)) => {
            warn!("{}", e);
            let _ = ws.close(None).await;
            return Err(e.into());
        }
        Err(e) => {
            warn!("bad address frame: {}", e);
            let _ = ws.close(None).await;
            return Err(e.into());
        }
    };
    if plain.len() > header_len {
        session.push_early(Bytes::copy_from_slice(&plain[header_len..]));
    }
    session.set_dest(dest.clone());

    let connect = TcpStream::connect(dest.to_string());
    tokio::pin!(connect);
    session.advance(Stage::AwaitPeer);

    // queue further tunnel messages while the real connection opens
    let mut remote = loop {
        tokio::select! {
            res = &mut connect => match res {
                Ok(remote) => break remote,
                Err(e) => {
                    debug!("connect {} failed: {}", dest, e);
                    let _ = ws.close(None).await;
                    return Err(e.into());
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let plain = session.decrypt(&data)?;
                    session.push_early(Bytes::from(plain));
                }
                Some(Ok(Message::Ping(payload))) => ws.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = &mut deadline => return Err(Error::Timeout),
        }
    };
    info!("connecting {}", dest);

    for chunk in session.drain_early() {
        remote.write_all(&chunk).await?;
    }
    session.advance(Stage::Relay);

    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let plain = session.decrypt(&data)?;
                    remote.write_all(&plain).await?;
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Text(_)))
                | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("tunnel disconnected");
                    return Ok(());
                }
                Some(Err(e)) => {
                    debug!("tunnel error: {}", e);
                    return Err(e.into());
                }
            },
            r = remote.read(&mut buf) => match r {
                Ok(n) if n > 0 => {
                    let payload = session.encrypt(&buf[..n])?;
                    ws.send(Message::Binary(payload)).await?;
                }
                _ => {
                    debug!("remote disconnected");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            },
            _ = &mut deadline => {
                debug!("remote timeout");
                let _ = ws.close(None).await;
                return Err(Error::Timeout);
            }
        }
    }
}
