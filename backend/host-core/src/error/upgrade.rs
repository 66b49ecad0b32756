use common::ErrorLocation;

use std::io::Error as IoError;
use std::panic::Location;

use thiserror::Error as ThisError;

/// Failures while turning an accepted TCP stream into a framed channel.
///
/// Every variant maps to a `400 Bad Request` (or a plain close when the
/// request head never arrived) and leaves the session registry untouched.
#[derive(Debug, ThisError)]
pub enum UpgradeError {
    #[error("Malformed Request Error: {message} {location}")]
    MalformedRequest {
        message: String,
        location: ErrorLocation,
    },

    #[error("Not An Upgrade Error: {message} {location}")]
    NotUpgrade {
        message: String,
        location: ErrorLocation,
    },

    #[error("Missing Token Error: {message} {location}")]
    MissingToken {
        message: String,
        location: ErrorLocation,
    },

    #[error("Handshake Response Error: {message} {location}")]
    Response {
        message: String,
        location: ErrorLocation,
    },

    #[error("IO Error: {message} {location}")]
    Io {
        message: String,
        location: ErrorLocation,
    },
}

impl UpgradeError {
    /// Whether the peer should get a `400 Bad Request` before the close.
    pub fn is_bad_request(&self) -> bool {
        !matches!(self, UpgradeError::Io { .. })
    }
}

impl From<IoError> for UpgradeError {
    #[track_caller]
    fn from(error: IoError) -> Self {
        UpgradeError::Io {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
