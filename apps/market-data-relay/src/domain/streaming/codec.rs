//! Stream Codec Module
//!
//! JSON encoding and decoding for both sides of the relay.
//!
//! Upstream payloads are classified but never rewritten: the raw frame is what
//! subscribers receive, so a decode failure here only costs observability.

use super::messages::{
    ClientRequest, ControlMessage, ErrorMessage, SubscriptionMessage, SuccessMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the upstream stream and subscriber requests.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode an upstream text frame into its control classification.
    ///
    /// Alpaca sends messages as JSON arrays, where each element is a message
    /// object. Some control messages arrive as a single object. Elements that
    /// carry a known `T` tag but fail to deserialize are reported as
    /// `Opaque` rather than failing the whole frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON array or object.
    pub fn decode_upstream(&self, text: &str) -> Result<Vec<ControlMessage>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let raw_array: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
            Ok(raw_array.into_iter().map(Self::classify).collect())
        } else if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            Ok(vec![Self::classify(value)])
        } else {
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )))
        }
    }

    fn classify(value: serde_json::Value) -> ControlMessage {
        let tag = value
            .get("T")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let decoded = match tag.as_deref() {
            Some("success") => serde_json::from_value::<SuccessMessage>(value)
                .ok()
                .map(ControlMessage::Success),
            Some("error") => serde_json::from_value::<ErrorMessage>(value)
                .ok()
                .map(ControlMessage::Error),
            Some("subscription") => serde_json::from_value::<SubscriptionMessage>(value)
                .ok()
                .map(ControlMessage::Subscription),
            _ => None,
        };

        decoded.unwrap_or(ControlMessage::Opaque(tag))
    }

    /// Decode a subscriber request.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object matching
    /// [`ClientRequest`].
    pub fn decode_client(&self, text: &str) -> Result<ClientRequest, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a value to JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
