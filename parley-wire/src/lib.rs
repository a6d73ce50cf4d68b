#![deny(unsafe_code)]

//! Wire-level message types for the parley RPC protocol.
//!
//! A parley connection carries three message kinds as JSON text frames:
//!
//! - Request: `{"request":true,"id":42,"method":"echo","data":{...}}`
//! - Response: `{"response":true,"ok":true,"id":42,"data":{...}}` on success,
//!   `{"response":true,"ok":false,"id":42,"errorCode":404,"errorReason":"..."}`
//!   on failure
//! - Notification: `{"notification":true,"method":"bye","data":{...}}`
//!
//! The codec here is pure: parsing and serialization only, no I/O. The only
//! state in this crate is [`RequestIdGenerator`], which hands out request ids
//! for one peer.
//!
//! The literal text frames `"ping"` and `"pong"` are reserved for transport
//! liveness and are not valid messages; [`Message::parse`] only classifies
//! JSON objects, so those frames (and any other non-object payload) are
//! rejected at the codec boundary.

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::{Value, json};

pub mod close_code {
    //! Close codes used by the peer engine.

    /// Normal close initiated by the host.
    pub const NORMAL: u16 = 4000;

    /// Soft disconnect: the transport is about to be replaced and the peer
    /// must not treat the close as terminal.
    pub const SOFT_DISCONNECT: u16 = 4001;

    /// Abnormal close (timeout, transport already closed).
    pub const ABNORMAL: u16 = 1006;
}

/// Reason string sent alongside [`close_code::SOFT_DISCONNECT`].
pub const SOFT_DISCONNECT_REASON: &str = "reconnecting";

/// Close reason some remote stacks report when they drop a connection for
/// replacement without attaching the 4001 code.
pub const REMOTE_DROP_REASON: &str = "Connection dropped by remote peer.";

/// Literal text frame used as a transport-level liveness probe.
pub const PING_FRAME: &str = "ping";

/// Literal text frame used as the liveness reply.
pub const PONG_FRAME: &str = "pong";

/// A request expecting exactly one correlated response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Sender-assigned id; unique among the sender's outstanding requests.
    pub id: u32,
    pub method: String,
    pub data: Option<Value>,
}

/// A success reply to a [`Request`], carrying the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessResponse {
    pub id: u32,
    pub data: Option<Value>,
}

/// An error reply to a [`Request`], carrying the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: u32,
    pub error_code: i32,
    pub error_reason: String,
}

/// A one-way message expecting no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub data: Option<Value>,
}

/// One parsed wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    SuccessResponse(SuccessResponse),
    ErrorResponse(ErrorResponse),
    Notification(Notification),
}

impl Message {
    /// Build a request message.
    pub fn request(id: u32, method: impl Into<String>, data: Option<Value>) -> Self {
        Message::Request(Request {
            id,
            method: method.into(),
            data,
        })
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, data: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            data,
        })
    }

    /// Parse one text frame into a message.
    ///
    /// Returns `None` for malformed frames. A frame is well-formed when it is
    /// a JSON object tagged with exactly one of `request`, `response`, or
    /// `notification` set to `true`, and the fields required by that kind are
    /// present with the right types:
    ///
    /// - request: `id` (u32) and `method` (string)
    /// - response: `id` (u32) and `ok` (bool); `ok == false` additionally
    ///   requires an integer `errorCode` and a string `errorReason`
    /// - notification: `method` (string)
    ///
    /// A `data` field of JSON `null` is treated as absent.
    pub fn parse(text: &str) -> Option<Message> {
        let value: Value = serde_json::from_str(text).ok()?;
        let obj = value.as_object()?;

        let tagged = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
        let id_field = || obj.get("id").and_then(Value::as_u64).and_then(|id| u32::try_from(id).ok());
        let method_field = || obj.get("method").and_then(Value::as_str).map(str::to_owned);
        let data_field = || obj.get("data").filter(|v| !v.is_null()).cloned();

        match (tagged("request"), tagged("response"), tagged("notification")) {
            (true, false, false) => Some(Message::Request(Request {
                id: id_field()?,
                method: method_field()?,
                data: data_field(),
            })),
            (false, true, false) => {
                let id = id_field()?;
                if obj.get("ok").and_then(Value::as_bool)? {
                    Some(Message::SuccessResponse(SuccessResponse {
                        id,
                        data: data_field(),
                    }))
                } else {
                    let error_code = obj
                        .get("errorCode")
                        .and_then(Value::as_i64)
                        .and_then(|code| i32::try_from(code).ok())?;
                    let error_reason = obj.get("errorReason").and_then(Value::as_str)?.to_owned();
                    Some(Message::ErrorResponse(ErrorResponse {
                        id,
                        error_code,
                        error_reason,
                    }))
                }
            }
            (false, false, true) => Some(Message::Notification(Notification {
                method: method_field()?,
                data: data_field(),
            })),
            _ => None,
        }
    }

    /// Serialize this message to its text-frame form.
    pub fn to_text(&self) -> String {
        let value = match self {
            Message::Request(r) => {
                let mut value = json!({
                    "request": true,
                    "id": r.id,
                    "method": r.method,
                });
                if let Some(data) = &r.data {
                    value["data"] = data.clone();
                }
                value
            }
            Message::SuccessResponse(r) => {
                let mut value = json!({
                    "response": true,
                    "id": r.id,
                    "ok": true,
                });
                if let Some(data) = &r.data {
                    value["data"] = data.clone();
                }
                value
            }
            Message::ErrorResponse(r) => json!({
                "response": true,
                "id": r.id,
                "ok": false,
                "errorCode": r.error_code,
                "errorReason": r.error_reason,
            }),
            Message::Notification(n) => {
                let mut value = json!({
                    "notification": true,
                    "method": n.method,
                });
                if let Some(data) = &n.data {
                    value["data"] = data.clone();
                }
                value
            }
        };
        value.to_string()
    }
}

impl Request {
    /// Build the success response for this request. Copies the request id.
    pub fn success_response(&self, data: Option<Value>) -> Message {
        Message::SuccessResponse(SuccessResponse { id: self.id, data })
    }

    /// Build an error response for this request. Copies the request id.
    pub fn error_response(&self, error_code: i32, error_reason: impl Into<String>) -> Message {
        Message::ErrorResponse(ErrorResponse {
            id: self.id,
            error_code,
            error_reason: error_reason.into(),
        })
    }
}

/// Generates request ids for one peer.
///
/// Ids only need to be unique among the peer's outstanding requests, so a
/// randomly seeded wrapping counter is enough.
pub struct RequestIdGenerator {
    next: AtomicU32,
}

impl RequestIdGenerator {
    /// Create a generator starting at a random id.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(rand::random()),
        }
    }

    /// Hand out the next request id.
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let msg = Message::request(42, "echo", Some(json!({"v": 1})));
        let parsed = Message::parse(&msg.to_text()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn notification_round_trips() {
        let msg = Message::notification("bye", None);
        let parsed = Message::parse(&msg.to_text()).unwrap();
        assert_eq!(parsed, msg);
        assert!(!msg.to_text().contains("data"));
    }

    #[test]
    fn responses_copy_the_request_id() {
        let request = Request {
            id: 7,
            method: "echo".into(),
            data: None,
        };

        match request.success_response(Some(json!([1, 2]))) {
            Message::SuccessResponse(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.data, Some(json!([1, 2])));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        match request.error_response(404, "no such method") {
            Message::ErrorResponse(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.error_code, 404);
                assert_eq!(r.error_reason, "no such method");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn error_response_round_trips() {
        let msg = Message::ErrorResponse(ErrorResponse {
            id: 3,
            error_code: 418,
            error_reason: "teapot".into(),
        });
        assert_eq!(Message::parse(&msg.to_text()).unwrap(), msg);
    }

    #[test]
    fn classification_requires_exactly_one_tag() {
        // No tag at all.
        assert_eq!(Message::parse(r#"{"id":1,"method":"m"}"#), None);
        // Two tags.
        assert_eq!(
            Message::parse(r#"{"request":true,"response":true,"id":1,"method":"m","ok":true}"#),
            None
        );
        // Tag present but false.
        assert_eq!(Message::parse(r#"{"request":false,"id":1,"method":"m"}"#), None);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        // Not JSON.
        assert_eq!(Message::parse("not json"), None);
        // Not an object.
        assert_eq!(Message::parse("[1,2,3]"), None);
        // Request without a method.
        assert_eq!(Message::parse(r#"{"request":true,"id":1}"#), None);
        // Request with a non-numeric id.
        assert_eq!(Message::parse(r#"{"request":true,"id":"x","method":"m"}"#), None);
        // Request id out of u32 range.
        assert_eq!(
            Message::parse(r#"{"request":true,"id":4294967296,"method":"m"}"#),
            None
        );
        // Response without ok.
        assert_eq!(Message::parse(r#"{"response":true,"id":1}"#), None);
        // Error response missing errorCode.
        assert_eq!(
            Message::parse(r#"{"response":true,"id":1,"ok":false,"errorReason":"r"}"#),
            None
        );
        // Error response missing errorReason.
        assert_eq!(
            Message::parse(r#"{"response":true,"id":1,"ok":false,"errorCode":500}"#),
            None
        );
        // Error response with non-integer errorCode.
        assert_eq!(
            Message::parse(r#"{"response":true,"id":1,"ok":false,"errorCode":"x","errorReason":"r"}"#),
            None
        );
        // Notification without a method.
        assert_eq!(Message::parse(r#"{"notification":true}"#), None);
    }

    #[test]
    fn liveness_frames_are_not_messages() {
        // The reserved liveness frames are not JSON objects and never classify,
        // nor do JSON string payloads that spell them.
        assert_eq!(Message::parse(PING_FRAME), None);
        assert_eq!(Message::parse(PONG_FRAME), None);
        assert_eq!(Message::parse(r#""ping""#), None);
        assert_eq!(Message::parse(r#""pong""#), None);
    }

    #[test]
    fn null_data_is_treated_as_absent() {
        match Message::parse(r#"{"request":true,"id":1,"method":"m","data":null}"#).unwrap() {
            Message::Request(r) => assert_eq!(r.data, None),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn success_response_data_is_optional() {
        match Message::parse(r#"{"response":true,"id":1,"ok":true}"#).unwrap() {
            Message::SuccessResponse(r) => assert_eq!(r.data, None),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn generated_ids_differ_across_calls() {
        let ids = RequestIdGenerator::new();
        let first = ids.next();
        let second = ids.next();
        assert_eq!(second, first.wrapping_add(1));
    }
}
