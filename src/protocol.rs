//! Inbound envelope parser.
//!
//! Each text frame from a client is a JSON object:
//!
//! ```text
//! {"action":"sendmessage","data":"<payload>"}
//! ```
//!
//! Only the `sendmessage` action is recognized. Its `data` value is
//! forwarded to peers without re-encoding: a JSON string is sent as its
//! unescaped contents, any other JSON value as the exact source text.

use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;

/// Action that triggers a broadcast.
pub const SEND_MESSAGE_ACTION: &str = "sendmessage";

/// Wire shape of an inbound frame. Fields are optional so a missing field
/// is reported as an incomplete envelope rather than a decode error.
#[derive(Debug, Deserialize)]
struct Envelope {
    action: Option<String>,
    data: Option<Box<RawValue>>,
}

/// Parsed inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Broadcast `data` to every registered connection.
    SendMessage { data: String },
    /// Valid envelope that does not describe a known action, or a
    /// `sendmessage` without `data`.
    Unrecognized { action: Option<String> },
}

/// Parse errors.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully decoded envelope.
    Complete(Command),
    /// Frame could not be decoded.
    Error(ParseError),
}

/// Parse a text frame into a command.
pub fn parse(frame: &str) -> ParseResult {
    // Derived struct impls also accept arrays, so require an object first
    if !frame.trim_start().starts_with('{') {
        return match serde_json::from_str::<serde::de::IgnoredAny>(frame) {
            Ok(_) => ParseResult::Error(ParseError::NotAnObject),
            Err(e) => ParseResult::Error(ParseError::Json(e)),
        };
    }
    let envelope: Envelope = match serde_json::from_str(frame) {
        Ok(envelope) => envelope,
        Err(e) => return ParseResult::Error(ParseError::Json(e)),
    };

    // `"data": null` deserializes to `None`
    match (envelope.action, envelope.data) {
        (Some(action), Some(data)) if action == SEND_MESSAGE_ACTION => {
            match payload_text(&data) {
                Ok(data) => ParseResult::Complete(Command::SendMessage { data }),
                Err(e) => ParseResult::Error(ParseError::Json(e)),
            }
        }
        (action, _) => ParseResult::Complete(Command::Unrecognized { action }),
    }
}

/// Parse a binary frame, which must carry UTF-8 JSON.
pub fn parse_bytes(frame: &[u8]) -> ParseResult {
    match std::str::from_utf8(frame) {
        Ok(text) => parse(text),
        Err(_) => ParseResult::Error(ParseError::InvalidUtf8),
    }
}

fn payload_text(data: &RawValue) -> Result<String, serde_json::Error> {
    let raw = data.get();
    if raw.starts_with('"') {
        serde_json::from_str(raw)
    } else {
        Ok(raw.to_owned())
    }
}
