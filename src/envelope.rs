//! Coordinator wire protocol
//!
//! Single responsibility: encode and decode the JSON envelopes exchanged on
//! the socket. One validating parser at the socket boundary; everything past
//! it works with the typed `Envelope` union.
//!
//! # Wire Format
//!
//! Envelopes are JSON text frames, discriminated by a `type` field:
//!
//! ## Request (client -> coordinator)
//! ```text
//! { "type": "req", "id": 7, "method": "get_channels", "params": [],
//!   "ts": 1700000000000, "sig": "<hex>" }
//! ```
//! The signature covers the canonical serialization of the exact
//! `{id, method, params, ts}` tuple.
//!
//! ## Response (coordinator -> client)
//! ```text
//! { "type": "res", "id": 7, "result": {...} }
//! { "type": "res", "id": 7, "error": { "code": -32000, "message": "..." } }
//! ```
//! `result` and `error` are mutually exclusive; a success with no payload
//! carries `result: null`.
//!
//! ## Push (coordinator -> client, unsolicited)
//! ```text
//! { "type": "push", "category": "channel_update", "payload": {...} }
//! ```
//! Pushes carry no `id` and are never correlated to a pending request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ClientError;

/// Error body of an error reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

/// The unit exchanged on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "req")]
    Request {
        id: u64,
        method: String,
        params: Value,
        /// Unix milliseconds at signing time
        ts: u64,
        /// Hex Ed25519 signature over the canonical {id, method, params, ts}
        sig: String,
    },

    #[serde(rename = "res")]
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    #[serde(rename = "push")]
    Push { category: String, payload: Value },
}

impl Envelope {
    /// Decode and validate one wire frame.
    ///
    /// All malformed input surfaces as a protocol error here; the receive
    /// loop logs and drops it rather than crashing.
    pub fn decode(text: &str) -> Result<Self, ClientError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ClientError::Protocol(format!("Malformed envelope: {}", e)))?;

        if let Envelope::Response {
            id,
            result,
            error: Some(_),
        } = &envelope
        {
            if !result.is_null() {
                return Err(ClientError::Protocol(format!(
                    "Response {} carries both result and error",
                    id
                )));
            }
        }

        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, ClientError> {
        serde_json::to_string(self)
            .map_err(|e| ClientError::Protocol(format!("Failed to encode envelope: {}", e)))
    }
}

/// Current time as unix milliseconds, for request timestamps.
pub fn unix_ts_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let envelope = Envelope::Request {
            id: 1,
            method: "get_config".to_string(),
            params: json!([]),
            ts: 1_700_000_000_000,
            sig: "ab".repeat(64),
        };

        let text = envelope.encode().unwrap();
        assert!(text.contains(r#""type":"req""#));
        assert_eq!(Envelope::decode(&text).unwrap(), envelope);
    }

    #[test]
    fn test_success_response() {
        let envelope =
            Envelope::decode(r#"{"type":"res","id":4,"result":{"channels":[]}}"#).unwrap();
        match envelope {
            Envelope::Response { id, result, error } => {
                assert_eq!(id, 4);
                assert_eq!(result, json!({"channels": []}));
                assert!(error.is_none());
            }
            other => panic!("Unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_error_response() {
        let envelope = Envelope::decode(
            r#"{"type":"res","id":4,"error":{"code":-32000,"message":"insufficient funds"}}"#,
        )
        .unwrap();
        match envelope {
            Envelope::Response { error: Some(e), .. } => {
                assert_eq!(e.code, -32000);
                assert_eq!(e.message, "insufficient funds");
            }
            other => panic!("Unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_push_has_no_id() {
        let envelope = Envelope::decode(
            r#"{"type":"push","category":"balance_update","payload":{"usdc":"10.5"}}"#,
        )
        .unwrap();
        assert!(matches!(envelope, Envelope::Push { .. }));
    }

    #[test]
    fn test_malformed_input_is_a_protocol_error() {
        for text in [
            "not json",
            r#"{"type":"unknown","id":1}"#,
            r#"{"id":1,"result":null}"#,
            r#"{"type":"req","id":1}"#,
            r#"{"type":"res","id":1,"result":{"ok":true},"error":{"code":1,"message":"x"}}"#,
        ] {
            let err = Envelope::decode(text).unwrap_err();
            assert!(matches!(err, ClientError::Protocol(_)), "{}", text);
        }
    }

    #[test]
    fn test_null_result_with_error_is_valid() {
        // Canonical error shape: result null or absent
        let text = r#"{"type":"res","id":2,"result":null,"error":{"code":1,"message":"nope"}}"#;
        assert!(Envelope::decode(text).is_ok());
    }
}
