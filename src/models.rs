use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,  // Queued or being sent
    Retrying, // Waiting on a backoff timer
    Sent,     // Acknowledged by the server
    Failed,   // Gave up, terminal
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Allowed moves: pending <-> retrying, and either of them into a terminal state.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Pending, MessageStatus::Retrying) => true,
            (MessageStatus::Retrying, MessageStatus::Pending) => true,
            (MessageStatus::Pending | MessageStatus::Retrying, MessageStatus::Sent) => true,
            (MessageStatus::Pending | MessageStatus::Retrying, MessageStatus::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub receiver_id: String,
    pub course_id: i64,
    pub status: MessageStatus,
    pub created_at: u64, // wall-clock millis, display only
    pub server_timestamp: Option<i64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Message {
    pub fn new(id: String, receiver_id: String, course_id: i64, content: String) -> Self {
        Self {
            id,
            content,
            receiver_id,
            course_id,
            status: MessageStatus::Pending,
            created_at: chrono::Utc::now().timestamp_millis() as u64,
            server_timestamp: None,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn outbound(&self) -> OutboundMessage {
        OutboundMessage {
            id: self.id.clone(),
            receiver_id: self.receiver_id.clone(),
            course_id: self.course_id,
            content: self.content.clone(),
        }
    }
}

/// What a transport actually puts on the wire for one send attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: String,
    pub receiver_id: String,
    pub course_id: i64,
    pub content: String,
}

impl OutboundMessage {
    /// Request/response body. The message id stays local on this path.
    pub fn payload(&self) -> SendMessagePayload {
        SendMessagePayload {
            receiver_id: self.receiver_id.clone(),
            course_id: self.course_id,
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: String,
    pub course_id: i64,
    pub content: String,
}

/// Server acknowledgment for one outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub message_id: String,
    #[serde(deserialize_with = "timestamp_millis")]
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(deserialize_with = "string_or_number")]
    pub other_user_id: String,
    #[serde(default)]
    pub other_user_name: String,
    pub course_id: i64,
    #[serde(default)]
    pub course_title: String,
    #[serde(default, alias = "otherUserProfileImage")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedUser {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub resolved: bool,
}

impl ResolvedUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            avatar: None,
            resolved: true,
        }
    }
}

/// The signed-in user as handed over by the credential provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default, alias = "fullName")]
    pub name: Option<String>,
}

/// A chat message authored by someone else, from a stream frame or a history load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub course_id: Option<i64>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_from_current_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserPresence {
    Online,
    Offline,
    Away,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceInfo {
    pub status: Option<UserPresence>,
    pub typing: bool,
}

/// Rows from the comprehensive user directory.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl DirectoryUser {
    pub fn canonical_id(&self) -> Option<String> {
        self.id.clone().or_else(|| self.user_id.clone())
    }

    pub fn display_name(&self, fallback: &str) -> String {
        self.full_name
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.user_name.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn into_resolved(self, fallback_name: &str) -> Option<ResolvedUser> {
        let id = self.canonical_id()?;
        Some(ResolvedUser {
            name: self.display_name(fallback_name),
            id,
            email: self.email,
            avatar: self.profile_image,
            resolved: true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseInstructorRef {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub user_id: Option<String>,
    #[serde(default, alias = "fullName")]
    pub name: Option<String>,
}

/// Course metadata, only the parts identity resolution cares about.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseDetails {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub instructor_id: Option<String>,
    #[serde(default)]
    pub instructor_name: Option<String>,
    #[serde(default)]
    pub instructor: Option<CourseInstructorRef>,
}

impl CourseDetails {
    pub fn instructor_id(&self) -> Option<String> {
        self.instructor_id.clone().or_else(|| {
            self.instructor
                .as_ref()
                .and_then(|i| i.id.clone().or_else(|| i.user_id.clone()))
        })
    }

    pub fn instructor_name(&self) -> Option<String> {
        self.instructor_name
            .clone()
            .or_else(|| self.instructor.as_ref().and_then(|i| i.name.clone()))
    }
}

/// Render a JSON scalar id as a string; the backend is inconsistent about numbers vs strings.
pub fn json_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    json_id(&value).ok_or_else(|| serde::de::Error::custom("expected a string or numeric id"))
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_id))
}

/// Accept epoch millis or an RFC 3339 string.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            })
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|dt| dt.and_utc().timestamp_millis())
            }),
        _ => None,
    }
}

fn timestamp_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    parse_timestamp(&value).ok_or_else(|| serde::de::Error::custom("invalid server timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Sent));
        assert!(Retrying.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_conversation_accepts_numeric_ids() {
        let conv: Conversation = serde_json::from_str(
            r#"{"otherUserId": 42, "otherUserName": "Dr. Smith", "courseId": 7,
                "courseTitle": "Rust 101", "otherUserProfileImage": "a.png"}"#,
        )
        .unwrap();
        assert_eq!(conv.other_user_id, "42");
        assert_eq!(conv.avatar.as_deref(), Some("a.png"));
    }

    #[test]
    fn test_ack_timestamp_formats() {
        let ack: Ack = serde_json::from_str(r#"{"messageId": "m1", "serverTimestamp": 1000}"#).unwrap();
        assert_eq!(ack.server_timestamp, 1000);

        let ack: Ack = serde_json::from_str(
            r#"{"messageId": "m1", "serverTimestamp": "1970-01-01T00:00:01Z"}"#,
        )
        .unwrap();
        assert_eq!(ack.server_timestamp, 1000);
    }

    #[test]
    fn test_payload_shape() {
        let msg = Message::new("m1".into(), "42".into(), 7, "hi".into());
        let json = serde_json::to_value(msg.outbound().payload()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"receiverId": "42", "courseId": 7, "content": "hi"})
        );
    }

    #[test]
    fn test_course_instructor_fallbacks() {
        let course: CourseDetails = serde_json::from_str(
            r#"{"id": 7, "title": "Rust", "instructor": {"userId": 9, "fullName": "Ada"}}"#,
        )
        .unwrap();
        assert_eq!(course.instructor_id().as_deref(), Some("9"));
        assert_eq!(course.instructor_name().as_deref(), Some("Ada"));
    }
}
