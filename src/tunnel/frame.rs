//! Wire frames exchanged over the tunnel link.
//!
//! Every frame is a tagged JSON object. Three kinds carry application
//! traffic (`forward`, `response`, `error`); `ping`/`pong` are the liveness
//! pair and travel outside the request/response envelope; `hello` is the
//! one-time link handshake. Payload bytes are opaque and base64-encoded on
//! the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, TunnelError};

/// Default frame size ceiling: 1 MiB of encoded JSON.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// base64 <-> raw bytes for payload fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A single frame on the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// One forwarded unit of work.
    Forward {
        id: String,
        #[serde(with = "b64")]
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        timeout_ms: u64,
    },
    /// Result of a forwarded operation.
    Response {
        id: String,
        status_code: u16,
        #[serde(with = "b64")]
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        latency_ms: u64,
    },
    /// Failure of a forwarded operation.
    Error {
        id: String,
        code: String,
        message: String,
        category: ErrorCategory,
    },
    /// Link handshake, sent once after connecting.
    Hello {
        link_key: String,
        features: Vec<String>,
    },
    /// Liveness probe.
    Ping { seq: u64, timestamp_ms: u64 },
    /// Liveness reply, echoing the probe's `seq` and `timestamp_ms`.
    Pong { seq: u64, timestamp_ms: u64 },
}

impl Frame {
    /// Serialize to wire text, rejecting frames over `max_bytes` before send.
    pub fn encode(&self, max_bytes: usize) -> Result<String, TunnelError> {
        let text = serde_json::to_string(self)
            .map_err(|e| TunnelError::Protocol(format!("frame encode: {e}")))?;
        if text.len() > max_bytes {
            return Err(TunnelError::FrameTooLarge {
                size: text.len(),
                max: max_bytes,
            });
        }
        Ok(text)
    }

    /// Parse wire text into a frame.
    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(text).map_err(|e| TunnelError::Protocol(format!("frame decode: {e}")))
    }

    /// The correlation id for request/response frames, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Forward { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_frame_round_trips() {
        let frame = Frame::Forward {
            id: "op-1".into(),
            payload: b"GET /status".to_vec(),
            headers: HashMap::from([("host".to_string(), "internal".to_string())]),
            timeout_ms: 5000,
        };
        let text = frame.encode(MAX_FRAME_BYTES).expect("encode");
        assert!(text.contains("\"type\":\"forward\""));

        match Frame::decode(&text).expect("decode") {
            Frame::Forward { id, payload, .. } => {
                assert_eq!(id, "op-1");
                assert_eq!(payload, b"GET /status");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_rejected_before_send() {
        let frame = Frame::Forward {
            id: "op-big".into(),
            payload: vec![0u8; 64],
            headers: HashMap::new(),
            timeout_ms: 1000,
        };
        let err = frame.encode(32).expect_err("must exceed ceiling");
        assert_eq!(err.code(), "FRAME_TOO_LARGE");
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let err = Frame::decode(r#"{"type":"mystery"}"#).expect_err("must fail");
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn ping_pong_carry_seq() {
        let text = Frame::Ping {
            seq: 7,
            timestamp_ms: 123,
        }
        .encode(MAX_FRAME_BYTES)
        .expect("encode");
        match Frame::decode(&text).expect("decode") {
            Frame::Ping { seq, timestamp_ms } => {
                assert_eq!(seq, 7);
                assert_eq!(timestamp_ms, 123);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
