//! JSON codec for pipe envelopes
//!
//! Each WebSocket text frame carries exactly one envelope, so message
//! boundaries come from the transport and the codec only deals with
//! size limits and (de)serialization.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{Envelope, PeerMessage};

/// Maximum encoded envelope size (1 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not an object")]
    PayloadNotObject,

    #[error("Payload has no type")]
    MissingType,
}

/// Encode an envelope into a text frame
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a text frame into an envelope
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Serialize a peer message into an envelope payload
pub fn encode_message(message: &PeerMessage) -> Result<Value, CodecError> {
    Ok(serde_json::to_value(message)?)
}

/// Parse an envelope payload into a peer message
///
/// Missing required fields and unknown types both surface as errors whose
/// text is suitable for an `error` reply's `diag`.
pub fn decode_message(payload: &Value) -> Result<PeerMessage, CodecError> {
    let object = payload.as_object().ok_or(CodecError::PayloadNotObject)?;
    if !object.get("type").is_some_and(Value::is_string) {
        return Err(CodecError::MissingType);
    }
    Ok(PeerMessage::deserialize(payload)?)
}
