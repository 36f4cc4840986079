// Streaming wire format: every frame is `{ "type": <kind>, "payload": {...} }`

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ChatError, Result};
use crate::models::{Ack, InboundMessage, OutboundMessage, UserPresence};

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    #[serde(alias = "senderId")]
    user_id: Value,
    #[serde(default = "default_typing", alias = "typing")]
    is_typing: bool,
}

fn default_typing() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserStatusPayload {
    user_id: Value,
    status: UserPresence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(InboundMessage),
    Ack(Ack),
    Typing { user_id: String, typing: bool },
    UserStatus { user_id: String, status: UserPresence },
    /// Well-formed frame of a kind we do not handle.
    Unknown(String),
}

/// Events surfaced to subscribers of the streaming transport. Acks stay internal.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(InboundMessage),
    Typing { user_id: String, typing: bool },
    UserStatus { user_id: String, status: UserPresence },
}

fn user_id(value: &Value) -> Result<String> {
    crate::models::json_id(value).ok_or_else(|| ChatError::Protocol("missing userId".into()))
}

pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let frame = match raw.kind.as_str() {
        "message" => InboundFrame::Message(serde_json::from_value(raw.payload)?),
        "ack" => InboundFrame::Ack(serde_json::from_value(raw.payload)?),
        "typing" => {
            let p: TypingPayload = serde_json::from_value(raw.payload)?;
            InboundFrame::Typing {
                user_id: user_id(&p.user_id)?,
                typing: p.is_typing,
            }
        }
        "user_status" => {
            let p: UserStatusPayload = serde_json::from_value(raw.payload)?;
            InboundFrame::UserStatus {
                user_id: user_id(&p.user_id)?,
                status: p.status,
            }
        }
        other => {
            warn!("Dropping frame of unrecognized kind '{}'", other);
            InboundFrame::Unknown(other.to_string())
        }
    };
    debug!("Decoded {} frame", raw.kind);
    Ok(frame)
}

/// Outbound send frame. Unlike the HTTP body this carries the message id, so the ack can be matched.
pub fn encode_message(message: &OutboundMessage) -> String {
    json!({
        "type": "message",
        "payload": {
            "id": message.id,
            "receiverId": message.receiver_id,
            "courseId": message.course_id,
            "content": message.content,
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_each_kind() {
        let frame = decode_frame(
            r#"{"type":"message","payload":{"id":"9","senderId":42,"courseId":7,"content":"hello"}}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Message(m) => {
                assert_eq!(m.sender_id.as_deref(), Some("42"));
                assert_eq!(m.content, "hello");
            }
            other => panic!("Expected message frame, got {:?}", other),
        }

        assert_eq!(
            decode_frame(r#"{"type":"ack","payload":{"messageId":"m1","serverTimestamp":1000}}"#).unwrap(),
            InboundFrame::Ack(Ack { message_id: "m1".into(), server_timestamp: 1000 })
        );
        assert_eq!(
            decode_frame(r#"{"type":"typing","payload":{"userId":42,"isTyping":false}}"#).unwrap(),
            InboundFrame::Typing { user_id: "42".into(), typing: false }
        );
        assert_eq!(
            decode_frame(r#"{"type":"user_status","payload":{"userId":"42","status":"away"}}"#).unwrap(),
            InboundFrame::UserStatus { user_id: "42".into(), status: UserPresence::Away }
        );
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        assert_eq!(
            decode_frame(r#"{"type":"reaction","payload":{}}"#).unwrap(),
            InboundFrame::Unknown("reaction".into())
        );
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(matches!(decode_frame("not json"), Err(ChatError::Protocol(_))));
        assert!(matches!(decode_frame(r#"{"payload":{}}"#), Err(ChatError::Protocol(_))));
        assert!(matches!(
            decode_frame(r#"{"type":"ack","payload":{"messageId":"m1"}}"#),
            Err(ChatError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_message_includes_id() {
        let frame = encode_message(&OutboundMessage {
            id: "msg_1".into(),
            receiver_id: "42".into(),
            course_id: 7,
            content: "hi".into(),
        });
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["payload"]["id"], "msg_1");
        assert_eq!(value["payload"]["courseId"], 7);
    }
}
