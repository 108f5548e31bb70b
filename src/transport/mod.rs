//! Outbound tunnel transport
//!
//! Establishes the WebSocket leg toward a tunnel server, either directly or
//! through an HTTP forward proxy. The proxy path opens a CONNECT tunnel
//! first and then runs the WebSocket handshake over it, so to the caller it
//! behaves like a direct socket to the endpoint; TLS is applied on top when
//! the endpoint uses the encrypted WebSocket scheme.

use crate::Error;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// The established tunnel leg
pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the WebSocket connection to `endpoint`, via the HTTP forward proxy
/// when one is configured
pub async fn connect_tunnel(endpoint: &Url, proxy: Option<&Url>) -> crate::Result<TunnelStream> {
    match proxy {
        Some(proxy) => connect_via_proxy(endpoint, proxy).await,
        None => {
            let (ws, _) = connect_async(endpoint.as_str()).await?;
            Ok(ws)
        }
    }
}

async fn connect_via_proxy(endpoint: &Url, proxy: &Url) -> crate::Result<TunnelStream> {
    let secure = endpoint.scheme() == "wss";
    let host = endpoint
        .host_str()
        .ok_or_else(|| Error::Config(format!("endpoint '{}' has no host", endpoint)))?;
    let port = endpoint.port().unwrap_or(if secure { 443 } else { 80 });

    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::Proxy("proxy URL has no host".to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    debug!(%endpoint, proxy = %proxy_host, secure, "connecting via http proxy");
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let response = read_connect_response(&mut stream).await?;
    check_connect_status(&response)?;

    let (ws, _) = client_async_tls(endpoint.as_str(), stream).await?;
    Ok(ws)
}

/// Read the proxy's CONNECT response headers, and nothing beyond them
async fn read_connect_response(stream: &mut TcpStream) -> crate::Result<Vec<u8>> {
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 4096 {
            return Err(Error::Proxy("oversized CONNECT response".to_string()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(Error::Proxy("proxy closed during CONNECT".to_string()));
        }
        response.push(byte[0]);
    }
    Ok(response)
}

fn check_connect_status(response: &[u8]) -> crate::Result<()> {
    let head = String::from_utf8_lossy(response);
    let status_line = head.lines().next().unwrap_or("");
    match status_line.split_whitespace().nth(1) {
        Some("200") => Ok(()),
        _ => Err(Error::Proxy(format!("CONNECT rejected: {}", status_line))),
    }
}
