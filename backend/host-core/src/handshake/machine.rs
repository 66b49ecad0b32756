//! The control handshake as an explicit state machine.
//!
//! The machine does no I/O. It turns one inbound control payload into one
//! [`HandshakeStep`], and the driver carries the step out.

use crate::error::handshake::HandshakeError;
use crate::handshake::messages::{ConnectionKind, ControlMessage};
use crate::handshake::verifier::HandshakeVerifier;
use crate::session::token::ClientToken;

use common::ErrorLocation;

use std::panic::Location;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

const KNOWN_TYPES: [&str; 5] = ["auth", "sign", "connectionType", "ok", "error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingAuth,
    AwaitingConnectionType,
    Dispatched,
    Failed,
}

/// A completed handshake, ready to be routed to a supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRequest {
    pub kind: ConnectionKind,
    /// Taken from the upgrade query, not from the control message.
    pub reconnection: bool,
    pub args: Option<Value>,
    pub signed_data: Option<String>,
}

#[derive(Debug)]
pub enum HandshakeStep {
    Reply(ControlMessage),
    Dispatch(ConnectionRequest),
    Fail(HandshakeError),
}

pub struct HandshakeMachine {
    token: ClientToken,
    reconnection: bool,
    sign_data: String,
    verifier: Arc<dyn HandshakeVerifier>,
    challenge: Option<String>,
    state: HandshakeState,
}

impl HandshakeMachine {
    pub fn new(
        token: ClientToken,
        reconnection: bool,
        sign_data: impl Into<String>,
        verifier: Arc<dyn HandshakeVerifier>,
    ) -> Self {
        Self {
            token,
            reconnection,
            sign_data: sign_data.into(),
            verifier,
            challenge: None,
            state: HandshakeState::AwaitingAuth,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Dispatched | HandshakeState::Failed
        )
    }

    pub fn on_message(&mut self, payload: &[u8]) -> HandshakeStep {
        if self.is_terminal() {
            return self.fail(HandshakeError::UnexpectedMessage {
                message: format!("control message after the handshake was {:?}", self.state),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let message = match parse(payload) {
            Ok(message) => message,
            Err(error) => return self.fail(error),
        };

        match message {
            ControlMessage::Error { reason } => self.fail(HandshakeError::Peer {
                message: reason,
                location: ErrorLocation::from(Location::caller()),
            }),
            ControlMessage::Auth {} => {
                self.state = HandshakeState::AwaitingConnectionType;
                self.challenge = Some(self.sign_data.clone());
                HandshakeStep::Reply(ControlMessage::sign(self.sign_data.clone()))
            }
            ControlMessage::ConnectionType {
                desired_connection_type,
                reconnection,
                args,
                signed_data,
            } => {
                if reconnection != self.reconnection {
                    debug!(
                        "[{}] connectionType says reconnection={reconnection}, the upgrade said {}",
                        self.token, self.reconnection
                    );
                }
                if let Err(reason) = self.verifier.verify(
                    &self.token,
                    self.challenge.as_deref(),
                    signed_data.as_deref(),
                ) {
                    return self.fail(HandshakeError::Verification {
                        message: reason,
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
                self.state = HandshakeState::Dispatched;
                HandshakeStep::Dispatch(ConnectionRequest {
                    kind: desired_connection_type,
                    reconnection: self.reconnection,
                    args,
                    signed_data,
                })
            }
            other @ (ControlMessage::Sign { .. } | ControlMessage::Ok { .. }) => {
                self.fail(HandshakeError::UnexpectedMessage {
                    message: format!("`{}` is not sent by clients", other.type_name()),
                    location: ErrorLocation::from(Location::caller()),
                })
            }
        }
    }

    fn fail(&mut self, error: HandshakeError) -> HandshakeStep {
        self.state = HandshakeState::Failed;
        HandshakeStep::Fail(error)
    }
}

fn parse(payload: &[u8]) -> Result<ControlMessage, HandshakeError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| HandshakeError::Malformed {
        message: format!("control message is not JSON: {e}"),
        location: ErrorLocation::from(Location::caller()),
    })?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| HandshakeError::Malformed {
            message: "control message has no `type`".to_string(),
            location: ErrorLocation::from(Location::caller()),
        })?
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(HandshakeError::UnexpectedMessage {
            message: format!("unknown control message type `{kind}`"),
            location: ErrorLocation::from(Location::caller()),
        });
    }

    serde_json::from_value(value).map_err(|e| {
        if kind == "connectionType" {
            HandshakeError::UnknownConnectionType {
                message: e.to_string(),
                location: ErrorLocation::from(Location::caller()),
            }
        } else {
            HandshakeError::Malformed {
                message: e.to_string(),
                location: ErrorLocation::from(Location::caller()),
            }
        }
    })
}
