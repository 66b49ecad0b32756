use common::ErrorLocation;

use thiserror::Error as ThisError;

pub const MANAGEMENT_ALREADY_RUNNING: &str = "Management connection is already running.";
pub const MANAGEMENT_NOT_RUNNING: &str = "Management connection is not running.";
pub const RUNTIME_ALREADY_RUNNING: &str = "Extension host is already running.";
pub const RUNTIME_NOT_RUNNING: &str = "Extension host is not running.";

/// Registry conflicts that are reported to the peer as an `error` control message.
///
/// `reason()` is the exact string the peer receives.
#[derive(Debug, ThisError)]
pub enum SessionError {
    #[error("Management Conflict Error: {reason} {location}")]
    ManagementAlreadyRunning {
        reason: &'static str,
        location: ErrorLocation,
    },

    #[error("Management Missing Error: {reason} {location}")]
    ManagementNotRunning {
        reason: &'static str,
        location: ErrorLocation,
    },

    #[error("Runtime Conflict Error: {reason} {location}")]
    RuntimeAlreadyRunning {
        reason: &'static str,
        location: ErrorLocation,
    },

    #[error("Runtime Missing Error: {reason} {location}")]
    RuntimeNotRunning {
        reason: &'static str,
        location: ErrorLocation,
    },
}

impl SessionError {
    #[track_caller]
    pub fn management_already_running() -> Self {
        SessionError::ManagementAlreadyRunning {
            reason: MANAGEMENT_ALREADY_RUNNING,
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn management_not_running() -> Self {
        SessionError::ManagementNotRunning {
            reason: MANAGEMENT_NOT_RUNNING,
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn runtime_already_running() -> Self {
        SessionError::RuntimeAlreadyRunning {
            reason: RUNTIME_ALREADY_RUNNING,
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn runtime_not_running() -> Self {
        SessionError::RuntimeNotRunning {
            reason: RUNTIME_NOT_RUNNING,
            location: ErrorLocation::caller(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::ManagementAlreadyRunning { reason, .. }
            | SessionError::ManagementNotRunning { reason, .. }
            | SessionError::RuntimeAlreadyRunning { reason, .. }
            | SessionError::RuntimeNotRunning { reason, .. } => reason,
        }
    }
}
