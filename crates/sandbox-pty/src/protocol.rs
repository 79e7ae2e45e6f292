//! JSON control messages exchanged with terminal clients.
//!
//! Every frame is an object `{ "type": <kind>, ...fields }`. Clients send
//! `input`/`data` and `resize`; the server sends `ready`, `data`, `exit`,
//! `error` and `command`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

// ── Client → server ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Keystrokes for the shell. Older clients send this as `input`.
    #[serde(alias = "input")]
    Data { data: String },
    Resize {
        #[serde(default)]
        cols: Option<Value>,
        #[serde(default)]
        rows: Option<Value>,
    },
}

const CLIENT_KINDS: &[&str] = &["data", "input", "resize"];

impl ClientMessage {
    /// Resize dimensions when both are present and positive, clamped to `u16`.
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        match self {
            Self::Resize { cols, rows } => Some((dimension(cols.as_ref()?)?, dimension(rows.as_ref()?)?)),
            Self::Data { .. } => None,
        }
    }
}

fn dimension(value: &Value) -> Option<u16> {
    let n = value.as_f64()?;
    if n.is_finite() && n >= 1.0 {
        Some(n.min(f64::from(u16::MAX)) as u16)
    } else {
        None
    }
}

/// Parse one inbound text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    if !CLIENT_KINDS.contains(&kind) {
        return Err(DecodeError::UnknownKind(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

// ── Server → client ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake complete; the PTY accepts input.
    Ready,
    Data {
        data: String,
    },
    Exit {
        code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        /// Lifetime of the shell in milliseconds.
        #[serde(
            rename = "executionTime",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        execution_time: Option<u64>,
    },
    Error {
        message: String,
    },
    /// A line the user submitted, seen by command detection.
    Command {
        command: String,
        cwd: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn data(data: impl Into<String>) -> Self {
        Self::Data { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Streaming UTF-8 ─────────────────────────────────────────────────

/// Turns PTY byte chunks into text without splitting multi-byte characters
/// across chunk boundaries. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for the next chunk.
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still buffered.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}
