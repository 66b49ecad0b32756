use common::ErrorLocation;

use std::io::Error as IoError;
use std::panic::Location;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum RuntimeError {
    #[error("Spawn Error: {message} {location}")]
    Spawn {
        message: String,
        location: ErrorLocation,
        #[source]
        source: IoError,
    },

    #[error("IPC Error: {message} {location}")]
    Ipc {
        message: String,
        location: ErrorLocation,
    },

    #[error("Handoff Error: {message} {location}")]
    Handoff {
        message: String,
        location: ErrorLocation,
    },

    #[error("Message Error: {message} {location}")]
    Message {
        message: String,
        location: ErrorLocation,
    },

    #[error("IO Error: {message} {location}")]
    Io {
        message: String,
        location: ErrorLocation,
    },
}

impl From<IoError> for RuntimeError {
    #[track_caller]
    fn from(error: IoError) -> Self {
        RuntimeError::Io {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    #[track_caller]
    fn from(error: serde_json::Error) -> Self {
        RuntimeError::Message {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
