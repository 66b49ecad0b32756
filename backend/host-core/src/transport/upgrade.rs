//! HTTP upgrade handling for incoming client connections.
//!
//! Reads the request head, checks that it is a WebSocket upgrade carrying a
//! `reconnectionToken`, writes the `101` response and returns the framed
//! transport. Every failure is answered with `400 Bad Request` and a close.

use crate::config::HostConfig;
use crate::error::upgrade::UpgradeError;
use crate::session::token::ClientToken;
use crate::transport::websocket::{FrameCodec, FrameMode, WebSocketTransport};

use common::ErrorLocation;

use std::net::SocketAddr;
use std::panic::Location;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::http::header::{SEC_WEBSOCKET_EXTENSIONS, UPGRADE};
use tokio_tungstenite::tungstenite::http::{Request, Version};
use url::form_urlencoded;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const HEAD_READ_CHUNK: usize = 4 * 1024;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const WEBSOCKET_PROTOCOL: &str = "websocket";
const RECONNECTION_TOKEN_PARAM: &str = "reconnectionToken";
const RECONNECTION_PARAM: &str = "reconnection";
const SKIP_FRAMES_PARAM: &str = "skipWebSocketFrames";
const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const PERMESSAGE_DEFLATE_RESPONSE: &str = "permessage-deflate; server_max_window_bits=15";
const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// What the upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub token: ClientToken,
    pub reconnection: bool,
    pub skip_frames: bool,
    /// Peer offered permessage-deflate and the host accepts it.
    pub compression: bool,
}

/// A transport that finished the HTTP upgrade, plus the query it was opened with.
pub struct UpgradedConnection {
    pub peer: SocketAddr,
    pub request: UpgradeRequest,
    pub transport: WebSocketTransport,
}

/// Perform the upgrade on a freshly accepted stream.
///
/// On error the peer has already been sent `400 Bad Request` (when the head
/// was readable) and the stream is closed.
pub async fn accept_upgrade(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: &HostConfig,
) -> Result<UpgradedConnection, UpgradeError> {
    match negotiate(&mut stream, config).await {
        Ok((request, response, leftover)) => {
            stream.write_all(&response).await?;
            debug!(
                "[{}] Upgraded connection from {peer} (reconnection: {}, compression: {}, skip frames: {})",
                request.token, request.reconnection, request.compression, request.skip_frames
            );
            let mode = if request.skip_frames {
                FrameMode::Raw
            } else {
                FrameMode::WebSocket
            };
            let codec = FrameCodec::new(mode, request.compression, true)
                .with_max_frame_bytes(config.channel.max_frame_bytes());
            let transport = WebSocketTransport::new(stream, codec, leftover)
                .with_write_stall_timeout(config.channel.write_stall_timeout());
            Ok(UpgradedConnection {
                peer,
                request,
                transport,
            })
        }
        Err(error) => {
            warn!("Rejected upgrade from {peer}: {error}");
            if error.is_bad_request() {
                let _ = stream.write_all(BAD_REQUEST_RESPONSE).await;
            }
            let _ = stream.shutdown().await;
            Err(error)
        }
    }
}

async fn negotiate(
    stream: &mut TcpStream,
    config: &HostConfig,
) -> Result<(UpgradeRequest, Vec<u8>, Vec<u8>), UpgradeError> {
    let (head, leftover) = read_request_head(stream).await?;
    let request = parse_request_head(&head)?;
    let upgrade = inspect_request(&request, config.compression.permessage_deflate)?;
    let response = build_response(&request, upgrade.compression)?;
    Ok((upgrade, response, leftover))
}

/// Read until the blank line ending the head. Returns the head and any bytes after it.
async fn read_request_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), UpgradeError> {
    let mut buffer = Vec::with_capacity(HEAD_READ_CHUNK);
    let mut chunk = vec![0u8; HEAD_READ_CHUNK];
    let mut searched = 0usize;

    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(UpgradeError::Io {
                message: "connection closed before the request head was complete".to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        }
        buffer.extend_from_slice(&chunk[..read]);

        let window_start = searched.saturating_sub(HEAD_TERMINATOR.len() - 1);
        if let Some(position) = buffer[window_start..]
            .windows(HEAD_TERMINATOR.len())
            .position(|window| window == HEAD_TERMINATOR)
        {
            let end = window_start + position + HEAD_TERMINATOR.len();
            let leftover = buffer.split_off(end);
            return Ok((buffer, leftover));
        }
        searched = buffer.len();

        if buffer.len() > MAX_HEAD_BYTES {
            return Err(UpgradeError::MalformedRequest {
                message: format!("request head exceeds {MAX_HEAD_BYTES} bytes"),
                location: ErrorLocation::from(Location::caller()),
            });
        }
    }
}

/// Parse a raw request head into an `http::Request`.
pub fn parse_request_head(head: &[u8]) -> Result<Request<()>, UpgradeError> {
    let text = std::str::from_utf8(head).map_err(|e| UpgradeError::MalformedRequest {
        message: format!("request head is not UTF-8: {e}"),
        location: ErrorLocation::from(Location::caller()),
    })?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(UpgradeError::MalformedRequest {
            message: format!("invalid request line: {request_line:?}"),
            location: ErrorLocation::from(Location::caller()),
        });
    };

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => {
            return Err(UpgradeError::MalformedRequest {
                message: format!("unsupported HTTP version {other}"),
                location: ErrorLocation::from(Location::caller()),
            });
        }
    };

    let mut builder = Request::builder().method(method).uri(target).version(version);
    for line in lines.filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(UpgradeError::MalformedRequest {
                message: format!("invalid header line: {line:?}"),
                location: ErrorLocation::from(Location::caller()),
            });
        };
        builder = builder.header(name.trim(), value.trim());
    }

    builder.body(()).map_err(|e| UpgradeError::MalformedRequest {
        message: e.to_string(),
        location: ErrorLocation::from(Location::caller()),
    })
}

/// Check the upgrade headers and pull the session parameters out of the query.
pub fn inspect_request(
    request: &Request<()>,
    compression_enabled: bool,
) -> Result<UpgradeRequest, UpgradeError> {
    let is_websocket = request
        .headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case(WEBSOCKET_PROTOCOL));
    if !is_websocket {
        return Err(UpgradeError::NotUpgrade {
            message: "missing `Upgrade: websocket` header".to_string(),
            location: ErrorLocation::from(Location::caller()),
        });
    }

    let query = request.uri().query().unwrap_or_default();
    let token = first_query_value(query, RECONNECTION_TOKEN_PARAM)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| UpgradeError::MissingToken {
            message: format!("query parameter `{RECONNECTION_TOKEN_PARAM}` is required"),
            location: ErrorLocation::from(Location::caller()),
        })?;
    let reconnection = first_query_value(query, RECONNECTION_PARAM).as_deref() == Some("true");
    let skip_frames = first_query_value(query, SKIP_FRAMES_PARAM).as_deref() == Some("true");

    let offered_deflate = request
        .headers()
        .get_all(SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|extension| {
            extension
                .split(';')
                .next()
                .is_some_and(|name| name.trim() == PERMESSAGE_DEFLATE)
        });

    Ok(UpgradeRequest {
        token: ClientToken::new(token),
        reconnection,
        skip_frames,
        compression: compression_enabled && offered_deflate && !skip_frames,
    })
}

fn first_query_value(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}

/// Serialize the `101 Switching Protocols` response.
pub fn build_response(request: &Request<()>, compression: bool) -> Result<Vec<u8>, UpgradeError> {
    let response = create_response(request).map_err(|e| UpgradeError::NotUpgrade {
        message: e.to_string(),
        location: ErrorLocation::from(Location::caller()),
    })?;

    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("Switching Protocols")
    );
    for (name, value) in response.headers() {
        let value = value.to_str().map_err(|e| UpgradeError::Response {
            message: e.to_string(),
            location: ErrorLocation::from(Location::caller()),
        })?;
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if compression {
        head.push_str(&format!(
            "{SEC_WEBSOCKET_EXTENSIONS}: {PERMESSAGE_DEFLATE_RESPONSE}\r\n"
        ));
    }
    head.push_str("\r\n");
    Ok(head.into_bytes())
}
