pub mod channel;
pub mod config;
pub mod handshake;
pub mod runtime;
pub mod session;
pub mod upgrade;

pub use channel::ChannelError;
pub use config::ConfigError;
pub use handshake::HandshakeError;
pub use runtime::RuntimeError;
pub use session::SessionError;
pub use upgrade::UpgradeError;

use common::ErrorLocation;

use std::io::Error as IoError;
use std::panic::Location;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Listener Error: {message} {location}")]
    Listener {
        message: String,
        location: ErrorLocation,
    },
}

impl From<IoError> for HostError {
    #[track_caller]
    fn from(error: IoError) -> Self {
        HostError::Listener {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
