//! Control-socket message definitions.
//!
//! Every message on the control socket is a [`ControlMessage`] encoded as
//! UTF-8 JSON behind a 4-byte big-endian length prefix. Requests carry a
//! fresh correlation id; the matching response reuses it.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Maximum encoded size of one control message (1 MB).
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Well-known routing categories.
pub mod category {
    /// Server-wide operations.
    pub const SYSTEM: &str = "system";
    /// Session registry operations.
    pub const SESSION: &str = "session";
    /// Server-originated events.
    pub const NOTIFICATION: &str = "notification";
}

/// Well-known action names.
pub mod action {
    /// Host supervisor changed the repository base path.
    pub const REPOSITORY_PATH_UPDATE: &str = "repository-path-update";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Server finished start-up.
    pub const READY: &str = "ready";
    /// List sessions.
    pub const LIST: &str = "list";
    /// Fetch one session.
    pub const GET: &str = "get";
    /// Kill a session.
    pub const KILL: &str = "kill";
    /// Rename a session.
    pub const RENAME: &str = "rename";
    /// Remove exited sessions past retention.
    pub const PRUNE: &str = "prune";
    /// Enumerate external multiplexer targets.
    pub const DISCOVER: &str = "discover";
    /// A session reached the exited state.
    pub const SESSION_EXITED: &str = "session-exited";
}

/// The role of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Expects exactly one response with the same id.
    Request,
    /// Answers a request.
    Response,
    /// Fire-and-forget event.
    Notification,
}

/// A correlated control-plane message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Correlation id.
    pub id: String,
    /// Request, response or notification.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Coarse routing key.
    pub category: String,
    /// Fine-grained operation name.
    pub action: String,
    /// Action-defined payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Failure description, present only on failed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlMessage {
    /// Create a request with a fresh correlation id.
    pub fn request(
        category: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: MessageKind::Request,
            category: category.into(),
            action: action.into(),
            payload,
            error: None,
        }
    }

    /// Create a notification.
    pub fn notification(
        category: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: MessageKind::Notification,
            ..Self::request(category, action, payload)
        }
    }

    /// Create a successful response to `request`.
    pub fn response_to(request: &ControlMessage, payload: serde_json::Value) -> Self {
        Self {
            id: request.id.clone(),
            kind: MessageKind::Response,
            category: request.category.clone(),
            action: request.action.clone(),
            payload,
            error: None,
        }
    }

    /// Create a failed response to `request`.
    pub fn error_response_to(request: &ControlMessage, error: impl Into<String>) -> Self {
        Self::error_response(
            request.id.clone(),
            request.category.clone(),
            request.action.clone(),
            error,
        )
    }

    /// Create a failed response from loose parts, used when the request
    /// itself could not be fully decoded.
    pub fn error_response(
        id: impl Into<String>,
        category: impl Into<String>,
        action: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            category: category.into(),
            action: action.into(),
            payload: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Returns true for failed responses.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Payload of `system/repository-path-update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPathUpdate {
    /// New base path, passed through unexpanded.
    pub path: String,
}

/// Payload naming a single session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    /// Session id.
    pub id: String,
}

/// Payload of `session/kill`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRequest {
    /// Session id.
    pub id: String,
    /// Signal name or number; SIGTERM when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Payload of `session/rename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    /// Session id.
    pub id: String,
    /// New display name.
    pub name: String,
}

/// Payload of `session/prune`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneRequest {
    /// Only exited sessions that exited at least this long ago are removed.
    pub older_than_secs: u64,
}

/// Result of decoding one length-prefixed control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A well-formed message.
    Message(ControlMessage),
    /// The frame was complete but its body is not a valid message.
    Malformed {
        /// Correlation id, if one could be recovered from the body.
        id: Option<String>,
        /// Human-readable cause.
        reason: String,
    },
}

/// Length-prefixed JSON codec for control messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl ControlCodec {
    /// Create a new control codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a message with its length prefix.
    pub fn encode(&self, message: &ControlMessage) -> Result<Bytes> {
        let body =
            serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if body.len() > MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_CONTROL_MESSAGE_SIZE,
            });
        }

        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Try to decode one message from the front of `data`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete. A complete frame
    /// whose body does not parse is reported as [`Decoded::Malformed`]
    /// together with the bytes consumed, so the stream stays aligned.
    /// An oversized length prefix is reported as
    /// [`ProtocolError::FrameTooLarge`]; a reader stays aligned by skipping
    /// the prefix plus `size` bytes.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Decoded, usize)>> {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_CONTROL_MESSAGE_SIZE,
            });
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if data.len() < total {
            return Ok(None);
        }

        Ok(Some((decode_body(&data[LENGTH_PREFIX_SIZE..total]), total)))
    }
}

fn decode_body(body: &[u8]) -> Decoded {
    match serde_json::from_slice::<ControlMessage>(body) {
        Ok(message) => Decoded::Message(message),
        Err(err) => {
            let id = serde_json::from_slice::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));
            Decoded::Malformed {
                id,
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_ids_are_unique() {
        let a = ControlMessage::request(category::SYSTEM, action::PING, json!(null));
        let b = ControlMessage::request(category::SYSTEM, action::PING, json!(null));
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, MessageKind::Request);
    }

    #[test]
    fn test_response_reuses_request_id() {
        let req = ControlMessage::request(
            category::SYSTEM,
            action::REPOSITORY_PATH_UPDATE,
            json!({"path": "~/Projects"}),
        );
        let resp = ControlMessage::response_to(&req, json!({"success": true}));

        assert_eq!(resp.id, req.id);
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.category, "system");
        assert_eq!(resp.action, "repository-path-update");
        assert!(!resp.is_error());
    }

    #[test]
    fn test_json_field_names() {
        let req = ControlMessage::request(category::SESSION, action::LIST, json!({}));
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["type"], "request");
        assert_eq!(value["category"], "session");
        assert_eq!(value["action"], "list");
        assert!(value.get("error").is_none());

        let err = ControlMessage::error_response_to(&req, "boom");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let raw = r#"{"id":"1","type":"notification","category":"system","action":"ready"}"#;
        let msg: ControlMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.payload, serde_json::Value::Null);
        assert_eq!(msg.kind, MessageKind::Notification);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let codec = ControlCodec::new();
        let msg = ControlMessage::notification(category::SYSTEM, action::READY, json!(null));
        let encoded = codec.encode(&msg).unwrap();

        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_try_decode_streaming() {
        let codec = ControlCodec::new();
        let msg = ControlMessage::request(category::SESSION, action::GET, json!({"id": "abc"}));
        let encoded = codec.encode(&msg).unwrap();

        assert!(codec.try_decode(&encoded[..2]).unwrap().is_none());
        assert!(codec.try_decode(&encoded[..10]).unwrap().is_none());

        let (decoded, used) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, Decoded::Message(msg));
    }

    #[test]
    fn test_malformed_body_recovers_id() {
        let codec = ControlCodec::new();
        let body = br#"{"id":"req-7","type":"bogus"}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);

        let (decoded, used) = codec.try_decode(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        match decoded {
            Decoded::Malformed { id, .. } => assert_eq!(id.as_deref(), Some("req-7")),
            other => panic!("Expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_body_has_no_id() {
        let codec = ControlCodec::new();
        let body = b"\xff\xfe not json";
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);

        let (decoded, _) = codec.try_decode(&frame).unwrap().unwrap();
        assert!(matches!(decoded, Decoded::Malformed { id: None, .. }));
    }

    #[test]
    fn test_oversized_prefix_is_error() {
        let codec = ControlCodec::new();
        let frame = ((MAX_CONTROL_MESSAGE_SIZE as u32) + 1).to_be_bytes();
        assert!(matches!(
            codec.try_decode(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_typed_payloads() {
        let req = ControlMessage::request(
            category::SESSION,
            action::PRUNE,
            json!({"olderThanSecs": 30}),
        );
        let prune: PruneRequest = req.payload_as().unwrap();
        assert_eq!(prune.older_than_secs, 30);

        let kill: KillRequest = serde_json::from_value(json!({"id": "s1"})).unwrap();
        assert_eq!(kill.signal, None);

        let bad = ControlMessage::request(category::SESSION, action::RENAME, json!({"id": 1}));
        assert!(bad.payload_as::<RenameRequest>().is_err());
    }
}
