use common::ErrorLocation;

use std::io::Error as IoError;
use std::panic::Location;

use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite::Error as TungsteniteError;

#[derive(Debug, ThisError)]
pub enum ChannelError {
    #[error("Frame Error: {message} {location}")]
    Frame {
        message: String,
        location: ErrorLocation,
    },

    #[error("Protocol Error: {message} {location}")]
    Protocol {
        message: String,
        location: ErrorLocation,
    },

    #[error("Compression Error: {message} {location}")]
    Compression {
        message: String,
        location: ErrorLocation,
    },

    #[error("Closed Error: {message} {location}")]
    Closed {
        message: String,
        location: ErrorLocation,
    },

    #[error("IO Error: {message} {location}")]
    Io {
        message: String,
        location: ErrorLocation,
    },
}

impl From<IoError> for ChannelError {
    #[track_caller]
    fn from(error: IoError) -> Self {
        ChannelError::Io {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}

impl From<TungsteniteError> for ChannelError {
    #[track_caller]
    fn from(error: TungsteniteError) -> Self {
        ChannelError::Frame {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
