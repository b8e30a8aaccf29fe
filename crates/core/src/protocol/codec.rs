//! Encodes and decodes protocol frames.
//!
//! Every frame on the wire is a JSON object of the form
//! `{"event": {"<kind>": {...}}}`. Decoding is tolerant of extra fields so the
//! remote service can add new ones without breaking older clients, but an
//! unknown frame kind or a missing required field is a [`CodecError::MalformedFrame`].

use super::frame::{ClientFrame, ServerEvent};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Longest excerpt of an offending frame kept for diagnostics.
const FRAME_EXCERPT_CHARS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed frame: {reason} (frame: {frame})")]
    MalformedFrame { reason: String, frame: String },
    #[error("Failed to encode {kind} frame: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    event: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    event: T,
}

/// Serializes an outbound frame into its wire text.
pub fn encode(frame: &ClientFrame) -> Result<String, CodecError> {
    serde_json::to_string(&EnvelopeRef { event: frame }).map_err(|source| CodecError::Encode {
        kind: frame.kind(),
        source,
    })
}

/// Serializes a server event into its wire text. Used by fakes of the remote service.
pub fn encode_server_event(event: &ServerEvent) -> Result<String, CodecError> {
    serde_json::to_string(&EnvelopeRef { event }).map_err(|source| CodecError::Encode {
        kind: event.kind(),
        source,
    })
}

/// Parses wire text into a client frame descriptor.
pub fn decode_client_frame(raw: &str) -> Result<ClientFrame, CodecError> {
    decode(raw)
}

/// Parses wire text from the remote service into a server event descriptor.
pub fn decode_server_event(raw: &str) -> Result<ServerEvent, CodecError> {
    decode(raw)
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| malformed(raw, e))?;
    let value = unwrap_body(value).map_err(|e| malformed(raw, e))?;
    let envelope: Envelope<T> = serde_json::from_value(value).map_err(|e| malformed(raw, e))?;
    Ok(envelope.event)
}

/// Frames relayed through an HTTP gateway arrive as `{"body": "<frame json>"}`.
fn unwrap_body(value: Value) -> Result<Value, serde_json::Error> {
    let body = match &value {
        Value::Object(map) if !map.contains_key("event") => match map.get("body") {
            Some(Value::String(body)) => Some(body.clone()),
            _ => None,
        },
        _ => None,
    };
    match body {
        Some(body) => serde_json::from_str(&body),
        None => Ok(value),
    }
}

fn malformed(raw: &str, reason: impl ToString) -> CodecError {
    CodecError::MalformedFrame {
        reason: reason.to_string(),
        frame: excerpt(raw),
    }
}

/// Cuts diagnostic copies of frames down to a bounded length.
pub(crate) fn excerpt(raw: &str) -> String {
    if raw.chars().count() <= FRAME_EXCERPT_CHARS {
        raw.to_string()
    } else {
        let mut short: String = raw.chars().take(FRAME_EXCERPT_CHARS).collect();
        short.push_str("...");
        short
    }
}
