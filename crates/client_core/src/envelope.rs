//! Gate for untrusted real-time frames.
//!
//! Everything here is pure: a frame either becomes a typed [`ChatEnvelope`]
//! or is reported as rejected, and nothing else is touched.

use serde_json::Value;
use shared::protocol::{ChatEnvelope, CHAT_MESSAGE_KIND};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeRejection {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame kind is not chat_message")]
    WrongKind,
    #[error("frame has no numeric project_id")]
    MissingRoom,
    #[error("frame has no data object")]
    MissingPayload,
    #[error("payload content is missing or empty")]
    MissingContent,
    #[error("payload user_id is missing or not numeric")]
    MissingAuthorId,
    #[error("payload id is missing or not numeric")]
    MissingMessageId,
    #[error("payload user is missing or not an object")]
    MissingAuthor,
    #[error("payload project_id differs from the frame's")]
    RoomMismatch,
    #[error("payload does not decode: {0}")]
    Malformed(String),
}

pub fn is_valid_envelope(value: &Value) -> bool {
    check_envelope(value).is_ok()
}

/// Checks the structural rules of a chat broadcast frame.
pub fn check_envelope(value: &Value) -> Result<(), EnvelopeRejection> {
    let frame = value.as_object().ok_or(EnvelopeRejection::NotAnObject)?;
    if frame.get("type").and_then(Value::as_str) != Some(CHAT_MESSAGE_KIND) {
        return Err(EnvelopeRejection::WrongKind);
    }
    if !frame.get("project_id").is_some_and(is_integer) {
        return Err(EnvelopeRejection::MissingRoom);
    }
    let payload = frame
        .get("data")
        .and_then(Value::as_object)
        .ok_or(EnvelopeRejection::MissingPayload)?;

    let has_content = payload
        .get("content")
        .and_then(Value::as_str)
        .is_some_and(|content| !content.trim().is_empty());
    if !has_content {
        return Err(EnvelopeRejection::MissingContent);
    }
    if !payload.get("user_id").is_some_and(is_integer) {
        return Err(EnvelopeRejection::MissingAuthorId);
    }
    if !payload.get("id").is_some_and(is_integer) {
        return Err(EnvelopeRejection::MissingMessageId);
    }
    if !payload.get("user").is_some_and(Value::is_object) {
        return Err(EnvelopeRejection::MissingAuthor);
    }
    if let Some(payload_room) = payload.get("project_id") {
        if payload_room.as_i64() != frame.get("project_id").and_then(Value::as_i64) {
            return Err(EnvelopeRejection::RoomMismatch);
        }
    }
    Ok(())
}

/// Validates and decodes a frame. The payload inherits the envelope's room
/// when it does not repeat it.
pub fn parse_envelope(mut value: Value) -> Result<ChatEnvelope, EnvelopeRejection> {
    check_envelope(&value)?;

    let room = value.get("project_id").cloned();
    if let (Some(room), Some(payload)) = (room, value.get_mut("data").and_then(Value::as_object_mut))
    {
        payload.entry("project_id").or_insert(room);
    }

    serde_json::from_value(value).map_err(|err| EnvelopeRejection::Malformed(err.to_string()))
}

fn is_integer(value: &Value) -> bool {
    value.is_i64() || value.is_u64()
}

#[cfg(test)]
#[path = "tests/envelope_tests.rs"]
mod tests;
