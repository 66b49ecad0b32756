use host_core::channel::{MessageType, ProtocolMessage, ProtocolReader};
use host_core::server::HostServerHandle;
use host_core::session::{ClientToken, GraceStatus, SessionRegistry};
use host_core::transport::deflate::{Deflater, Inflater};
use host_core::{HostConfig, HostEvent};

use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);
const MAX_MESSAGE_BYTES: u32 = 1024 * 1024;

pub const MANAGEMENT: u8 = 1;
pub const EXTENSION_RUNTIME: u8 = 2;

/// Loopback server on an ephemeral port with short timers.
pub fn test_config(grace_ms: u64, short_grace_ms: u64) -> HostConfig {
    let mut config = HostConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.reconnection.grace_time_ms = grace_ms;
    config.reconnection.short_grace_time_ms = short_grace_ms;
    config.channel.acknowledge_time_ms = 50;
    config
}

/// A client speaking the persistent protocol over tokio-tungstenite.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    reader: ProtocolReader,
    next_id: u32,
    last_seen: u32,
}

impl TestClient {
    pub async fn connect(address: SocketAddr, token: &str, reconnection: bool) -> Self {
        let url = format!("ws://{address}/?reconnectionToken={token}&reconnection={reconnection}");
        let (ws, _) = connect_async(&url).await.expect("Failed to connect to host server");
        Self {
            ws,
            reader: ProtocolReader::new(MAX_MESSAGE_BYTES),
            next_id: 0,
            last_seen: 0,
        }
    }

    /// Continue the id sequence of an earlier connection for the same token.
    pub fn resume_from(mut self, previous: &TestClient) -> Self {
        self.next_id = previous.next_id;
        self.last_seen = previous.last_seen;
        self
    }

    /// Run `auth` and `connectionType`; returns the host's final reply.
    pub async fn handshake(&mut self, kind: u8, reconnection: bool, args: Option<Value>) -> Value {
        self.send_control(json!({"type": "auth", "auth": ""})).await;
        let sign = self.next_control().await;
        assert_eq!(sign["type"], "sign", "expected sign, got {sign}");

        let mut request = json!({
            "type": "connectionType",
            "desiredConnectionType": kind,
            "reconnection": reconnection,
            "signedData": sign["data"],
        });
        if let Some(args) = args {
            request["args"] = args;
        }
        self.send_control(request).await;
        self.next_control().await
    }

    pub async fn send_control(&mut self, value: Value) {
        let data = serde_json::to_vec(&value).expect("control json");
        self.send_raw(&ProtocolMessage::control(data)).await;
    }

    pub async fn send_regular(&mut self, data: &[u8]) {
        self.next_id += 1;
        let message = ProtocolMessage::regular(self.next_id, self.last_seen, data.to_vec());
        self.send_raw(&message).await;
    }

    pub async fn send_disconnect(&mut self) {
        self.send_raw(&ProtocolMessage::disconnect()).await;
    }

    async fn send_raw(&mut self, message: &ProtocolMessage) {
        self.ws
            .send(Message::Binary(message.encode().into()))
            .await
            .expect("Failed to send to host server");
    }

    /// Next protocol message, or `None` once the host closes.
    pub async fn next_message(&mut self) -> Option<ProtocolMessage> {
        timeout(WAIT, async {
            loop {
                if let Some(message) = self.reader.next_message().expect("protocol") {
                    return Some(message);
                }
                match self.ws.next().await {
                    Some(Ok(Message::Binary(bytes))) => self.reader.accept_chunk(&bytes),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .expect("Timed out waiting for the host")
    }

    pub async fn next_control(&mut self) -> Value {
        loop {
            let message = self.next_message().await.expect("host closed before replying");
            if message.kind == MessageType::Control {
                return serde_json::from_slice(&message.data).expect("control json");
            }
        }
    }

    /// Next regular message not seen before. Replayed duplicates are skipped.
    pub async fn next_regular(&mut self) -> Vec<u8> {
        loop {
            let message = self.next_message().await.expect("host closed before sending");
            if message.kind != MessageType::Regular || message.id <= self.last_seen {
                continue;
            }
            self.last_seen = message.id;
            return message.data;
        }
    }

    /// Whether the host closes this connection within [`WAIT`].
    pub async fn closed_by_host(&mut self) -> bool {
        timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .is_ok()
    }
}

const CLIENT_MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// A client that negotiates permessage-deflate and frames by hand, so every
/// message it sends is compressed against one shared window.
pub struct DeflateClient {
    stream: TcpStream,
    deflater: Deflater,
    inflater: Inflater,
    inbound: Vec<u8>,
    reader: ProtocolReader,
    next_id: u32,
}

impl DeflateClient {
    pub async fn connect(address: SocketAddr, token: &str) -> Self {
        let mut stream = TcpStream::connect(address).await.expect("Failed to connect to host server");
        let request = format!(
            "GET /?reconnectionToken={token}&reconnection=false HTTP/1.1\r\n\
             Host: {address}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.expect("upgrade request");

        // One byte at a time so no frame bytes are consumed with the head.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            timeout(WAIT, stream.read_exact(&mut byte))
                .await
                .expect("Timed out waiting for the upgrade response")
                .expect("upgrade response");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).expect("utf8 response head");
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected response: {head}");
        assert!(
            head.to_ascii_lowercase().contains("permessage-deflate"),
            "compression was not accepted: {head}"
        );

        Self {
            stream,
            deflater: Deflater::new(),
            inflater: Inflater::new(false),
            inbound: Vec::new(),
            reader: ProtocolReader::new(MAX_MESSAGE_BYTES),
            next_id: 0,
        }
    }

    pub fn control(value: Value) -> ProtocolMessage {
        ProtocolMessage::control(serde_json::to_vec(&value).expect("control json"))
    }

    pub fn regular(&mut self, data: &[u8]) -> ProtocolMessage {
        self.next_id += 1;
        ProtocolMessage::regular(self.next_id, 0, data.to_vec())
    }

    /// Compress each message into its own frame and write them in one go.
    pub async fn send(&mut self, messages: &[ProtocolMessage]) {
        let mut bytes = Vec::new();
        for message in messages {
            let compressed = self.deflater.deflate(&message.encode()).expect("deflate");
            let header = FrameHeader {
                is_final: true,
                rsv1: true,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Data(Data::Binary),
                mask: Some(CLIENT_MASK),
            };
            header.format(compressed.len() as u64, &mut bytes).expect("frame header");
            bytes.extend(
                compressed
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ CLIENT_MASK[i % 4]),
            );
        }
        self.stream.write_all(&bytes).await.expect("Failed to send to host server");
    }

    pub async fn next_message(&mut self) -> ProtocolMessage {
        timeout(WAIT, async {
            loop {
                if let Some(message) = self.reader.next_message().expect("protocol") {
                    return message;
                }
                if self.take_frame() {
                    continue;
                }
                let mut chunk = vec![0u8; 64 * 1024];
                let read = self.stream.read(&mut chunk).await.expect("read");
                assert!(read > 0, "host closed the connection");
                self.inbound.extend_from_slice(&chunk[..read]);
            }
        })
        .await
        .expect("Timed out waiting for the host")
    }

    /// Move one complete binary frame from `inbound` into the protocol reader.
    fn take_frame(&mut self) -> bool {
        let mut cursor = Cursor::new(self.inbound.as_slice());
        let Some((header, length)) = FrameHeader::parse(&mut cursor).expect("frame header") else {
            return false;
        };
        let start = cursor.position() as usize;
        let end = start + length as usize;
        if self.inbound.len() < end {
            return false;
        }
        let payload: Vec<u8> = self.inbound.drain(..end).skip(start).collect();
        if header.opcode == OpCode::Data(Data::Binary) {
            let data = if header.rsv1 {
                self.inflater.inflate(&payload).expect("inflate")
            } else {
                payload
            };
            self.reader.accept_chunk(&data);
        }
        true
    }

    pub async fn next_control(&mut self) -> Value {
        loop {
            let message = self.next_message().await;
            if message.kind == MessageType::Control {
                return serde_json::from_slice(&message.data).expect("control json");
            }
        }
    }

    pub async fn next_regular(&mut self) -> Vec<u8> {
        loop {
            let message = self.next_message().await;
            if message.kind == MessageType::Regular {
                return message.data;
            }
        }
    }
}

pub async fn next_event(events: &mut UnboundedReceiver<HostEvent>) -> HostEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("Timed out waiting for a host event")
        .expect("event stream closed")
}

pub async fn management_status(registry: &SessionRegistry, token: &str) -> Option<GraceStatus> {
    let token = ClientToken::new(token);
    registry
        .snapshot()
        .await
        .into_iter()
        .find(|client| client.token == token)
        .and_then(|client| client.management)
}

/// Poll the registry until the token's management status satisfies `accept`.
pub async fn wait_for_status(
    registry: &SessionRegistry,
    token: &str,
    accept: impl Fn(Option<GraceStatus>) -> bool,
) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if accept(management_status(registry, token).await) {
            return true;
        }
        sleep(POLL).await;
    }
    false
}

pub fn disconnected(status: Option<GraceStatus>) -> bool {
    status.is_some_and(|status| !status.connected && status.grace_scheduled)
}

pub async fn start(config: HostConfig) -> (HostServerHandle, UnboundedReceiver<HostEvent>) {
    let mut handle = host_core::start_host_server(config)
        .await
        .expect("Failed to start host server");
    let events = handle.take_events().expect("events");
    (handle, events)
}
