//! The persistent protocol that every client connection speaks.

pub mod persistent;
pub mod protocol;

pub use persistent::{ChannelHandoff, ChannelState, Delivery, PersistentChannel};
pub use protocol::{MessageType, ProtocolMessage, ProtocolReader};
