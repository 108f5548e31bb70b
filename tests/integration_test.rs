//! Integration tests for the wisp tunnel
//!
//! Spins up real listeners on loopback: a scripted destination server, a
//! tunnel server and a SOCKS5 front-end wired together, then drives them
//! with a plain TCP client the way a SOCKS application would.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wisp_tunnel::config::{LocalConfig, ServerConfig};
use wisp_tunnel::local::LocalNode;
use wisp_tunnel::server::ServerNode;

const PASSWORD: &str = "integration-secret";

/// Start a tunnel server and a SOCKS5 front-end pointed at it, both on
/// ephemeral loopback ports; returns the SOCKS5 address
async fn start_pair(local_method: &str, server_method: &str, timeout_secs: f64) -> SocketAddr {
    let server = ServerNode::bind(ServerConfig {
        local_address: "127.0.0.1".to_string(),
        remote_port: 0,
        password: PASSWORD.to_string(),
        method: server_method.to_string(),
        timeout: Duration::from_secs_f64(timeout_secs),
    })
    .await
    .expect("Failed to bind tunnel server");
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let local = LocalNode::bind(
        LocalConfig {
            local_address: "127.0.0.1".to_string(),
            local_port: 0,
            servers: vec![format!("ws://{}", server_addr)],
            remote_port: server_addr.port(),
            password: PASSWORD.to_string(),
            method: local_method.to_string(),
            timeout: Duration::from_secs_f64(timeout_secs),
            scheme: "ws".to_string(),
        },
        None,
    )
    .await
    .expect("Failed to bind SOCKS5 front-end");
    let socks_addr = local.local_addr().unwrap();
    tokio::spawn(local.run());

    socks_addr
}

/// Complete the SOCKS5 greeting and return the connected client
async fn socks5_greet(socks: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(socks).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
    client
}

fn ipv4_octets(addr: &SocketAddr) -> [u8; 4] {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => v4.octets(),
        std::net::IpAddr::V6(_) => panic!("expected an IPv4 listener"),
    }
}

#[tokio::test]
async fn test_ipv4_connect_relays_early_data_in_order() {
    let request_line = b"GET / HTTP/1.0\r\n\r\n";
    let response_line = b"HTTP/1.0 200 OK\r\n\r\n";

    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap();
    let dest_task = tokio::spawn(async move {
        let (mut stream, _) = destination.accept().await.unwrap();
        let mut first = vec![0u8; request_line.len()];
        stream.read_exact(&mut first).await.unwrap();
        stream.write_all(response_line).await.unwrap();
        // second round trip after the relay is established
        let mut second = vec![0u8; 4];
        stream.read_exact(&mut second).await.unwrap();
        stream.write_all(&second).await.unwrap();
        (first, second)
    });

    let socks = start_pair("aes-128-ctr", "aes-128-ctr", 30.0).await;
    let mut client = socks5_greet(socks).await;

    // CONNECT request with the HTTP request appended as early data, sent
    // before the tunnel leg can possibly be open
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ipv4_octets(&dest_addr));
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    request.extend_from_slice(request_line);
    client.write_all(&request).await.unwrap();

    // fixed optimistic success reply echoing the requested port
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..8], &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0]);
    assert_eq!(
        u16::from_be_bytes([reply[8], reply[9]]),
        dest_addr.port()
    );

    let mut response = vec![0u8; response_line.len()];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response, response_line);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    let (first, second) = dest_task.await.unwrap();
    assert_eq!(first, request_line);
    assert_eq!(&second, b"ping");
}

#[tokio::test]
async fn test_domain_connect_roundtrip() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap();
    let dest_task = tokio::spawn(async move {
        let (mut stream, _) = destination.accept().await.unwrap();
        let mut greeting = vec![0u8; 5];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, b"hello");
        stream.write_all(b"world").await.unwrap();
    });

    let socks = start_pair("chacha20", "chacha20", 30.0).await;
    let mut client = socks5_greet(socks).await;

    // ATYP=3 with the destination given as a name
    let name = b"127.0.0.1";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    request.extend_from_slice(name);
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"hello").await.unwrap();
    let mut response = [0u8; 5];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"world");

    dest_task.await.unwrap();
}

#[tokio::test]
async fn test_legacy_table_method_means_no_cipher_on_the_local_side() {
    // the front-end maps "table" to the identity transform while the server
    // is configured with the empty method; the two interoperate
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap();
    let dest_task = tokio::spawn(async move {
        let (mut stream, _) = destination.accept().await.unwrap();
        let mut data = [0u8; 4];
        stream.read_exact(&mut data).await.unwrap();
        stream.write_all(&data).await.unwrap();
    });

    let socks = start_pair("table", "", 30.0).await;
    let mut client = socks5_greet(socks).await;

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ipv4_octets(&dest_addr));
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"echo").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"echo");

    dest_task.await.unwrap();
}

#[tokio::test]
async fn test_unsupported_command_gets_error_reply() {
    let socks = start_pair("", "", 30.0).await;
    let mut client = socks5_greet(socks).await;

    // BIND is not supported
    let request = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x07, 0x00, 0x01]);

    // and the session is closed afterwards
    let mut rest = [0u8; 1];
    match client.read(&mut rest).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} extra bytes after error reply", n),
    }
}

#[tokio::test]
async fn test_unsupported_address_type_closes_silently() {
    let socks = start_pair("", "", 30.0).await;
    let mut client = socks5_greet(socks).await;

    // ATYP=4 (IPv6) is rejected without any SOCKS reply
    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&[0u8; 16]);
    request.extend_from_slice(&[0x00, 0x50]);
    client.write_all(&request).await.unwrap();

    let mut rest = [0u8; 1];
    match client.read(&mut rest).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected silent close, got {} bytes", n),
    }
}

#[tokio::test]
async fn test_malformed_request_aborts_only_its_session() {
    let socks = start_pair("", "", 30.0).await;

    // a session sending a single stray byte as its request dies alone
    let mut broken = socks5_greet(socks).await;
    broken.write_all(&[0x05]).await.unwrap();
    let mut rest = [0u8; 1];
    match broken.read(&mut rest).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected abort, got {} bytes", n),
    }

    // the listener keeps accepting and a well-formed session still works
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap();
    let dest_task = tokio::spawn(async move {
        let (mut stream, _) = destination.accept().await.unwrap();
        let mut data = [0u8; 2];
        stream.read_exact(&mut data).await.unwrap();
        stream.write_all(&data).await.unwrap();
    });

    let mut client = socks5_greet(socks).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ipv4_octets(&dest_addr));
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"ok").await.unwrap();
    let mut echoed = [0u8; 2];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ok");

    dest_task.await.unwrap();
}

#[tokio::test]
async fn test_idle_session_is_torn_down() {
    let socks = start_pair("", "", 0.5).await;
    let mut client = socks5_greet(socks).await;

    // no request is ever sent; the fixed deadline must close the session
    let mut rest = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut rest)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("unexpected {} bytes from an idle session", n),
        Err(_) => panic!("idle session was not torn down"),
    }
}
