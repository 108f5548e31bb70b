//! Local SOCKS5 front-end
//!
//! Accepts application connections, walks them through the SOCKS5 greeting
//! and CONNECT request, then opens the WebSocket leg to a randomly chosen
//! tunnel server and relays traffic, encrypting outbound chunks and
//! decrypting inbound ones. Payload received while the tunnel is still
//! opening is queued in arrival order and flushed as soon as it is up.

use crate::config::LocalConfig;
use crate::crypto::CipherPair;
use crate::endpoint::EndpointSet;
use crate::protocol::{self, ProtocolError};
use crate::session::{Session, SessionGuard, Side, Stage};
use crate::transport;
use crate::{Error, KEEPALIVE_INTERVAL, RELAY_BUFFER_SIZE};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// The SOCKS5 listener and the read-only state its sessions share
pub struct LocalNode {
    listener: TcpListener,
    context: Arc<LocalContext>,
}

struct LocalContext {
    config: LocalConfig,
    endpoints: EndpointSet,
    proxy: Option<Url>,
}

impl LocalNode {
    /// Bind the SOCKS5 listener. A bind failure is fatal to the process.
    pub async fn bind(config: LocalConfig, proxy: Option<Url>) -> crate::Result<Self> {
        let endpoints = EndpointSet::new(&config.servers, &config.scheme, config.remote_port)?;
        let listener =
            TcpListener::bind((config.local_address.as_str(), config.local_port)).await?;
        info!("SOCKS5 listening on {}", listener.local_addr()?);
        if let Some(proxy) = &proxy {
            info!("http proxy: {}", proxy);
        }
        Ok(Self {
            listener,
            context: Arc::new(LocalContext {
                config,
                endpoints,
                proxy,
            }),
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever; each session runs in its own task and
    /// its failures never reach the listener
    pub async fn run(self) -> crate::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("local connection from {}", peer_addr);

            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                let _guard = SessionGuard::enter(Side::Local);
                if let Err(e) = handle_connection(stream, context).await {
                    debug!("local session ended: {}", e);
                }
            });
        }
    }
}

/// Drive one SOCKS5 session from greeting to teardown
async fn handle_connection(mut stream: TcpStream, ctx: Arc<LocalContext>) -> crate::Result<()> {
    let cipher = CipherPair::new(&ctx.config.password, &ctx.config.method, true)?;
    let mut session = Session::new(cipher);
    // fixed deadline from connection start
    let deadline = sleep(ctx.config.timeout);
    tokio::pin!(deadline);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    // Greeting: reply "version 5, no authentication" to whatever arrived;
    // the offered method list is not inspected
    let n = tokio::select! {
        r = stream.read(&mut buf) => r?,
        _ = &mut deadline => return Err(Error::Timeout),
    };
    if n == 0 {
        return Ok(());
    }
    stream.write_all(&protocol::NO_AUTH_REPLY).await?;
    session.advance(Stage::Request);

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let n = tokio::select! {
        r = stream.read(&mut buf) => r?,
        _ = &mut deadline => return Err(Error::Timeout),
    };
    if n == 0 {
        return Ok(());
    }
    let request = &buf[..n];

    let cmd = request.get(1).copied().ok_or(ProtocolError::MalformedFrame)?;
    if cmd != protocol::CMD_CONNECT {
        warn!("unsupported command: {}", cmd);
        stream.write_all(&protocol::CMD_UNSUPPORTED_REPLY).await?;
        return Err(ProtocolError::UnsupportedCommand(cmd).into());
    }

    let (dest, header_len) =
        match protocol::decode_address(request, protocol::SOCKS_REQUEST_ATYP_OFFSET) {
            Ok(parsed) => parsed,
            Err(e @ ProtocolError::UnsupportedAddressType(_)) => {
                // closed without a SOCKS reply, unlike the command case
                warn!("{}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

    // success is declared before the tunnel leg is known to be reachable
    stream
        .write_all(&protocol::connect_reply(dest.port()))
        .await?;

    let frame = protocol::encode_address(&dest);
    if n > header_len {
        session.push_early(Bytes::copy_from_slice(&request[header_len..n]));
    }
    session.set_dest(dest);

    let endpoint = ctx.endpoints.pick().clone();
    let connect = transport::connect_tunnel(&endpoint, ctx.proxy.as_ref());
    tokio::pin!(connect);
    session.advance(Stage::AwaitPeer);

    // queue whatever the application sends while the tunnel leg opens
    let mut ws = loop {
        tokio::select! {
            res = &mut connect => break res?,
            r = stream.read(&mut buf) => {
                let n = r?;
                if n == 0 {
                    return Ok(());
                }
                session.push_early(Bytes::copy_from_slice(&buf[..n]));
            }
            _ = &mut deadline => return Err(Error::Timeout),
        }
    };

    if let Some(dest) = session.dest() {
        info!("connecting {} via {}", dest, endpoint);
    }

    // address frame first, then the buffered chunks in arrival order
    let head = session.encrypt(&frame)?;
    ws.send(Message::Binary(head)).await?;
    for chunk in session.drain_early() {
        let payload = session.encrypt(&chunk)?;
        ws.send(Message::Binary(payload)).await?;
    }
    session.advance(Stage::Relay);

    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            r = stream.read(&mut buf) => match r {
                Ok(n) if n > 0 => {
                    let payload = session.encrypt(&buf[..n])?;
                    ws.send(Message::Binary(payload)).await?;
                }
                _ => {
                    debug!("local disconnected");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let plain = session.decrypt(&data)?;
                    stream.write_all(&plain).await?;
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Text(_)))
                | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("remote disconnected");
                    return Ok(());
                }
                Some(Err(e)) => {
                    debug!("remote error: {}", e);
                    return Err(e.into());
                }
            },
            _ = keepalive.tick() => {
                ws.send(Message::Ping(Vec::new())).await?;
            }
            _ = &mut deadline => {
                debug!("local timeout");
                let _ = ws.close(None).await;
                return Err(Error::Timeout);
            }
        }
    }
}
