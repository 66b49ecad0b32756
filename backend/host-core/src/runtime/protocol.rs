//! Newline-delimited JSON messages on the runtime IPC hook.

use crate::error::runtime::RuntimeError;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host → runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Sent together with the transport file descriptor.
    Socket {
        #[serde(with = "base64_bytes")]
        initial_data_chunk: Vec<u8>,
        #[serde(with = "base64_bytes", default)]
        pending_frame_bytes: Vec<u8>,
        skip_frames: bool,
        compression_enabled: bool,
        #[serde(with = "base64_bytes", default)]
        inflate_bytes: Vec<u8>,
    },
    ReduceGraceTime,
}

/// Runtime → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeMessage {
    Ready,
    Console {
        #[serde(default)]
        arguments: Value,
    },
}

pub(crate) fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, RuntimeError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub(crate) fn decode_line<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T, RuntimeError> {
    Ok(serde_json::from_slice(line)?)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
