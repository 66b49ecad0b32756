use crate::helpers::{MANAGEMENT, TestClient, start, test_config};

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn raw_request(address: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(address).await.expect("connect");
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read");
    String::from_utf8_lossy(&response).into_owned()
}

/// **VALUE**: Verifies upgrades without a reconnection token get `400`.
///
/// **WHY THIS MATTERS**: Every session is keyed by the token. Accepting a
/// connection without one would let it hijack handshake state.
///
/// **BUG THIS CATCHES**: Would catch the host upgrading the connection anyway
/// or hanging without answering.
#[tokio::test]
async fn given_upgrade_without_token_when_connecting_then_bad_request() {
    let (handle, _events) = start(test_config(2_000, 500)).await;

    let response = raw_request(
        handle.local_addr(),
        "GET /?reconnection=false HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 400"), "got {response:?}");

    handle.shutdown().await;
}

/// **VALUE**: Verifies plain HTTP requests are refused.
#[tokio::test]
async fn given_plain_http_request_when_connecting_then_bad_request() {
    let (handle, _events) = start(test_config(2_000, 500)).await;

    let response = raw_request(
        handle.local_addr(),
        "GET /?reconnectionToken=alpha HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 400"), "got {response:?}");

    handle.shutdown().await;
}

/// **VALUE**: Verifies a handshake message the host does not expect ends the
/// connection with an error reply.
///
/// **BUG THIS CATCHES**: Would catch the host waiting forever on a client that
/// speaks the wrong protocol.
#[tokio::test]
async fn given_upgraded_client_when_sending_unknown_control_then_error_and_close() {
    let (handle, _events) = start(test_config(2_000, 500)).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;

    client
        .send_control(serde_json::json!({"type": "bogus"}))
        .await;
    let reply = client.next_control().await;

    assert_eq!(reply["type"], "error");
    assert!(client.closed_by_host().await);

    handle.shutdown().await;
}

/// **VALUE**: Verifies an unknown connection type is refused after auth.
#[tokio::test]
async fn given_unknown_connection_type_when_requested_then_error_reply() {
    let (handle, _events) = start(test_config(2_000, 500)).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;

    let reply = client.handshake(MANAGEMENT + 40, false, None).await;

    assert_eq!(reply["type"], "error");

    handle.shutdown().await;
}
