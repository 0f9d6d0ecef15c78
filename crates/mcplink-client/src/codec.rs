//! Wire codec: one JSON object per line.
//!
//! Each frame is a single newline-delimited JSON-RPC message. Decoding
//! classifies the frame by shape (id + method = request, method alone =
//! notification, id alone = response) and rejects anything malformed with a
//! distinguishable [`DecodeError`] instead of an opaque serde failure.

use serde_json::Value;

use crate::error::DecodeError;
use crate::protocol::{Notification, Request, Response, JSONRPC_VERSION};

/// Maximum accepted frame length in bytes.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// The wire unit: request, response or notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request carrying an id; the peer must answer it.
    Request(Request),
    /// An answer to a previously issued request.
    Response(Response),
    /// A one-way message with no id.
    Notification(Notification),
}

impl Message {
    /// Method name, if this message carries one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

/// Encode a message as a single-line JSON frame (no trailing newline).
pub fn encode(message: &Message) -> Result<String, serde_json::Error> {
    match message {
        Message::Request(r) => serde_json::to_string(r),
        Message::Response(r) => serde_json::to_string(r),
        Message::Notification(n) => serde_json::to_string(n),
    }
}

/// Decode a single frame into a message.
pub fn decode(frame: &str) -> Result<Message, DecodeError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge {
            len: frame.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let value: Value = serde_json::from_str(frame)?;
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        other => return Err(DecodeError::BadRpcVersion(other.map(String::from))),
    }

    let has_id = obj.contains_key("id");
    let has_method = obj.contains_key("method");

    if has_method {
        if has_id {
            Ok(Message::Request(serde_json::from_value(value)?))
        } else {
            Ok(Message::Notification(serde_json::from_value(value)?))
        }
    } else if has_id {
        // Presence-check against the raw object: a response must carry
        // exactly one of result/error, and `"result": null` counts as
        // present.
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");
        if has_result == has_error {
            return Err(DecodeError::AmbiguousResponse);
        }
        Ok(Message::Response(serde_json::from_value(value)?))
    } else {
        Err(DecodeError::UnknownShape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcError;
    use serde_json::json;

    #[test]
    fn test_round_trip_request() {
        let msg = Message::Request(Request::new(
            3i64,
            "tools/call",
            Some(json!({"name": "get_weather", "arguments": {"city": "Boston"}})),
        ));
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_round_trip_response() {
        let msg = Message::Response(Response::result(3i64, json!({"tempF": 42})));
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);

        let msg = Message::Response(Response::error(
            4i64,
            RpcError {
                code: RpcError::INVALID_PARAMS,
                message: "missing city".to_string(),
                data: None,
            },
        ));
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_round_trip_notification() {
        let msg = Message::Notification(Notification::new("notifications/initialized", None));
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_reject_invalid_json() {
        assert!(matches!(
            decode("{not json"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_reject_non_object() {
        assert!(matches!(decode("[1,2,3]"), Err(DecodeError::NotAnObject)));
    }

    #[test]
    fn test_reject_bad_rpc_version() {
        let frame = r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#;
        assert!(matches!(
            decode(frame),
            Err(DecodeError::BadRpcVersion(Some(v))) if v == "1.0"
        ));

        let frame = r#"{"id":1,"method":"x"}"#;
        assert!(matches!(
            decode(frame),
            Err(DecodeError::BadRpcVersion(None))
        ));
    }

    #[test]
    fn test_reject_ambiguous_response() {
        let frame = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert!(matches!(decode(frame), Err(DecodeError::AmbiguousResponse)));

        let frame = r#"{"jsonrpc":"2.0","id":1}"#;
        assert!(matches!(decode(frame), Err(DecodeError::AmbiguousResponse)));
    }

    #[test]
    fn test_reject_unknown_shape() {
        let frame = r#"{"jsonrpc":"2.0","params":{}}"#;
        assert!(matches!(decode(frame), Err(DecodeError::UnknownShape)));
    }

    #[test]
    fn test_reject_oversized_frame() {
        let padding = "x".repeat(MAX_FRAME_LEN);
        let frame = format!(r#"{{"jsonrpc":"2.0","method":"{}"}}"#, padding);
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_null_result_is_a_response() {
        let frame = r#"{"jsonrpc":"2.0","id":9,"result":null}"#;
        match decode(frame).unwrap() {
            Message::Response(resp) => {
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_string_id_response() {
        let frame = r#"{"jsonrpc":"2.0","id":"req-1","result":{}}"#;
        match decode(frame).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.id, "req-1".into());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
