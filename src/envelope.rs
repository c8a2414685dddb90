//! Envelope type and wire codec.
//!
//! Every message exchanged with the server, on either transport, is a
//! two-element JSON array: `[command, payload]`.
//!
//! # Format
//!
//! ```json
//! ["who", {"id": 3}]
//! ```
//!
//! - `command` is a non-empty string naming the operation.
//! - `payload` is a JSON object; unknown fields pass through opaquely.
//!
//! The payload field `"id"` is reserved for request/reply correlation.
//! Its absence means fire-and-forget. Id injection returns a new
//! envelope instead of mutating the caller's payload, so payload
//! ownership stays unambiguous.

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Map, Value, json};

use crate::correlation::RequestId;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Reserved payload field carrying the correlation id.
pub const REQUEST_ID_FIELD: &str = "id";

// ============================================================================
// Envelope
// ============================================================================

/// The `(command, payload)` unit exchanged over the wire.
///
/// Immutable once constructed; builders like [`Envelope::with_request_id`]
/// return new envelopes rather than mutating in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Command name. Never empty.
    pub command: String,

    /// Argument object. Always a JSON object.
    pub payload: Value,
}

impl Envelope {
    /// Creates an envelope from a command name and payload object.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedEnvelope`] if `command` is empty or `payload`
    ///   is not a JSON object.
    pub fn new(command: impl Into<String>, payload: Value) -> Result<Self> {
        let command = command.into();
        if command.is_empty() {
            return Err(Error::malformed("empty command name"));
        }
        if !payload.is_object() {
            return Err(Error::malformed("payload is not a JSON object"));
        }
        Ok(Self { command, payload })
    }

    /// Encodes the envelope as a wire string: `[command, payload]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails (should not happen
    /// for values built from [`Envelope::new`]).
    pub fn encode(&self) -> Result<String> {
        let wire = serde_json::to_string(&json!([self.command, self.payload]))?;
        Ok(wire)
    }

    /// Decodes a wire string into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEnvelope`] if the text is not valid
    /// JSON, is not an array, has fewer than two elements, the command
    /// is not a non-empty string, or the payload is not an object.
    pub fn decode(wire: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(wire).map_err(|e| Error::malformed(format!("invalid JSON: {e}")))?;

        let Value::Array(mut elements) = value else {
            return Err(Error::malformed("wire message is not an array"));
        };
        if elements.len() < 2 {
            return Err(Error::malformed(format!(
                "expected [command, payload], got {} element(s)",
                elements.len()
            )));
        }

        // Extra trailing elements are tolerated and discarded.
        let payload = elements.swap_remove(1);
        let command = elements.swap_remove(0);

        let Value::String(command) = command else {
            return Err(Error::malformed("command is not a string"));
        };

        Self::new(command, payload)
    }

    /// Returns a new envelope with the correlation id injected into the
    /// payload under [`REQUEST_ID_FIELD`].
    #[must_use]
    pub fn with_request_id(&self, id: RequestId) -> Self {
        let mut payload: Map<String, Value> = match &self.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        payload.insert(REQUEST_ID_FIELD.to_string(), json!(id.as_u64()));

        Self {
            command: self.command.clone(),
            payload: Value::Object(payload),
        }
    }

    /// Reads the correlation id from the payload, if present.
    ///
    /// Non-integer `"id"` values are treated as absent: only ids this
    /// client generated can match, and those are always integers.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.payload
            .get(REQUEST_ID_FIELD)
            .and_then(Value::as_u64)
            .map(RequestId::from_raw)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_encode_format() {
        let envelope = Envelope::new("look", json!({"target": "door"})).expect("valid");
        let wire = envelope.encode().expect("encode");
        assert_eq!(wire, r#"["look",{"target":"door"}]"#);
    }

    #[test]
    fn test_decode_basic() {
        let envelope = Envelope::decode(r#"["who", {"players": ["Alice"]}]"#).expect("decode");
        assert_eq!(envelope.command, "who");
        assert_eq!(envelope.payload["players"][0], "Alice");
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let err = Envelope::decode("not json at all").unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_decode_rejects_non_array() {
        let err = Envelope::decode(r#"{"command": "look"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_decode_rejects_short_array() {
        let err = Envelope::decode(r#"["look"]"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_decode_rejects_empty_command() {
        let err = Envelope::decode(r#"["", {}]"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_decode_rejects_non_object_payload() {
        let err = Envelope::decode(r#"["look", 42]"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_decode_tolerates_extra_elements() {
        let envelope = Envelope::decode(r#"["look", {}, "extra"]"#).expect("decode");
        assert_eq!(envelope.command, "look");
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let envelope = Envelope::decode(r#"["look", {"a": 1, "weird": [null]}]"#).expect("decode");
        assert_eq!(envelope.payload["weird"][0], Value::Null);
    }

    #[test]
    fn test_new_rejects_empty_command() {
        let err = Envelope::new("", json!({})).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_with_request_id_does_not_mutate() {
        let original = Envelope::new("who", json!({"filter": "all"})).expect("valid");
        let tagged = original.with_request_id(RequestId::from_raw(9));

        assert!(original.request_id().is_none());
        assert_eq!(tagged.request_id(), Some(RequestId::from_raw(9)));
        assert_eq!(tagged.payload["filter"], "all");
    }

    #[test]
    fn test_request_id_ignores_non_integer() {
        let envelope = Envelope::decode(r#"["who", {"id": "abc"}]"#).expect("decode");
        assert!(envelope.request_id().is_none());
    }

    // Round-trip property over arbitrary commands and flat payloads.
    proptest! {
        #[test]
        fn prop_round_trip(
            command in "[a-z][a-z:._-]{0,20}",
            keys in proptest::collection::vec("[a-z]{1,8}", 0..5),
            values in proptest::collection::vec(any::<i64>(), 0..5),
        ) {
            let mut payload = Map::new();
            for (k, v) in keys.iter().zip(values.iter()) {
                payload.insert(k.clone(), json!(v));
            }

            let envelope = Envelope::new(command, Value::Object(payload)).expect("valid");
            let wire = envelope.encode().expect("encode");
            let decoded = Envelope::decode(&wire).expect("decode");

            prop_assert_eq!(decoded, envelope);
        }
    }
}
