use common::ErrorLocation;

use thiserror::Error as ThisError;

/// Reasons a connection never made it past the control handshake.
#[derive(Debug, ThisError)]
pub enum HandshakeError {
    #[error("Malformed Control Message Error: {message} {location}")]
    Malformed {
        message: String,
        location: ErrorLocation,
    },

    #[error("Unexpected Control Message Error: {message} {location}")]
    UnexpectedMessage {
        message: String,
        location: ErrorLocation,
    },

    #[error("Unknown Connection Type Error: {message} {location}")]
    UnknownConnectionType {
        message: String,
        location: ErrorLocation,
    },

    #[error("Peer Error: {message} {location}")]
    Peer {
        message: String,
        location: ErrorLocation,
    },

    #[error("Verification Error: {message} {location}")]
    Verification {
        message: String,
        location: ErrorLocation,
    },
}

impl HandshakeError {
    /// The text reported to the peer in an `error` control message.
    pub fn reason(&self) -> &str {
        match self {
            HandshakeError::Malformed { message, .. }
            | HandshakeError::UnexpectedMessage { message, .. }
            | HandshakeError::UnknownConnectionType { message, .. }
            | HandshakeError::Peer { message, .. }
            | HandshakeError::Verification { message, .. } => message,
        }
    }
}
