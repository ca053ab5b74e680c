//! Envelope shared by requests and responses in both directions.
//!
//! Wire shape: `{"seq":<u64>,"command":"<name>","payload":<any|null>}`.
//! A response echoes the `seq` of the request it answers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Command tag used for replies when the handler does not pick one.
pub const DEFAULT_RESPONSE_COMMAND: &str = "response";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(seq: u64, command: impl Into<String>, payload: Value) -> Self {
        Self {
            seq,
            command: command.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame)
            .map_err(|e| ProtocolError::malformed(format!("frame is not UTF-8: {e}")))?;

        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::malformed(format!("invalid JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::malformed("envelope must be a JSON object"));
        };

        let seq = match fields.remove("seq") {
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                ProtocolError::malformed(format!("seq must be a non-negative integer, got {n}"))
            })?,
            Some(Value::Null) | None => return Err(ProtocolError::malformed("missing seq")),
            Some(other) => {
                return Err(ProtocolError::malformed(format!(
                    "seq must be a non-negative integer, got {other}"
                )));
            }
        };

        let command = match fields.remove("command") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::String(_)) => return Err(ProtocolError::malformed("empty command")),
            Some(other) => {
                return Err(ProtocolError::malformed(format!(
                    "command must be a string, got {other}"
                )));
            }
            None => return Err(ProtocolError::malformed("missing command")),
        };

        Ok(Self {
            seq,
            command,
            payload: fields.remove("payload").unwrap_or(Value::Null),
        })
    }
}
