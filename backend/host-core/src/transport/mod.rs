//! Raw transport: HTTP upgrade, WebSocket framing, permessage-deflate.

pub mod deflate;
pub mod upgrade;
pub mod websocket;

pub use upgrade::{UpgradeRequest, UpgradedConnection, accept_upgrade};
pub use websocket::{FrameCodec, FrameMode, TransportHandoff, WebSocketTransport};
