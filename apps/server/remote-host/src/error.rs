use common::ErrorLocation;

use serde::Serialize;
use thiserror::Error;

/// Errors raised by the `remote-host` executable itself.
///
/// Library failures are flattened into [`RemoteHostError::Host`] so the whole
/// enum stays serializable for structured reporting.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum RemoteHostError {
    /// Logger setup failed
    #[error("Logger Error: {message} {location}")]
    Logger {
        message: String,
        location: ErrorLocation,
    },

    /// Config or log directory could not be determined or created
    #[error("Paths Error: {message} {location}")]
    Paths {
        message: String,
        location: ErrorLocation,
    },

    /// An environment override could not be applied
    #[error("Environment Error: {message} {location}")]
    Environment {
        message: String,
        location: ErrorLocation,
    },

    /// Error from host-core (listener, config validation)
    #[error("Host Error: {message} {location}")]
    Host {
        message: String,
        location: ErrorLocation,
    },
}
