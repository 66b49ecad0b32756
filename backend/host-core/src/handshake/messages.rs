//! Control messages exchanged before a connection is dispatched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::collections::BTreeMap;

const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Auth {},
    Sign {
        data: String,
    },
    ConnectionType {
        desired_connection_type: ConnectionKind,
        #[serde(default)]
        reconnection: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signed_data: Option<String>,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debug_port: Option<u16>,
    },
    Error {
        reason: String,
    },
}

impl ControlMessage {
    pub fn sign(data: impl Into<String>) -> Self {
        ControlMessage::Sign { data: data.into() }
    }

    pub fn ok(debug_port: Option<u16>) -> Self {
        ControlMessage::Ok { debug_port }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ControlMessage::Error {
            reason: reason.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Auth {} => "auth",
            ControlMessage::Sign { .. } => "sign",
            ControlMessage::ConnectionType { .. } => "connectionType",
            ControlMessage::Ok { .. } => "ok",
            ControlMessage::Error { .. } => "error",
        }
    }

    /// JSON bytes for the control payload.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// What the peer wants this connection to become.
///
/// Accepts the numeric wire form (`1`, `2`) as well as the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub enum ConnectionKind {
    Management,
    ExtensionRuntime,
}

impl TryFrom<Value> for ConnectionKind {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Number(number) => match number.as_u64() {
                Some(1) => Ok(ConnectionKind::Management),
                Some(2) => Ok(ConnectionKind::ExtensionRuntime),
                _ => Err(format!("unknown connection type {value}")),
            },
            Value::String(name) => match name.as_str() {
                "Management" | "management" => Ok(ConnectionKind::Management),
                "ExtensionRuntime" | "extensionRuntime" | "ExtensionHost" | "extensionHost" => {
                    Ok(ConnectionKind::ExtensionRuntime)
                }
                _ => Err(format!("unknown connection type {value}")),
            },
            _ => Err(format!("unknown connection type {value}")),
        }
    }
}

/// Start parameters carried in `connectionType.args` for an extension runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRuntimeParams {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub debug_id: Option<String>,
    #[serde(default, rename = "break")]
    pub break_on_start: bool,
    /// Debug port. `0` asks the host to pick one.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl Default for ExtensionRuntimeParams {
    fn default() -> Self {
        Self {
            language: default_language(),
            debug_id: None,
            break_on_start: false,
            port: None,
            env: BTreeMap::new(),
        }
    }
}

impl ExtensionRuntimeParams {
    /// Parse `args`, falling back to defaults when absent.
    pub fn from_args(args: Option<&Value>) -> Result<Self, serde_json::Error> {
        match args {
            Some(Value::Null) | None => Ok(Self::default()),
            Some(args) => ExtensionRuntimeParams::deserialize(args),
        }
    }
}
