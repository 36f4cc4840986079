// Error taxonomy for the chat engine
// Submit-time failures are returned to the caller; delivery failures only reach the event stream

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChatError {
    #[error("Authentication required. Please log in again.")]
    AuthRequired,

    #[error("Could not resolve user \"{identifier}\"{}", course_suffix(.course_id))]
    UnresolvedIdentity {
        identifier: String,
        course_id: Option<i64>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server rejected request with HTTP {status}: {body}")]
    ServerRejection { status: u16, body: String },

    #[error("Server error HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Unknown message ID: {0}")]
    UnknownMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn course_suffix(course_id: &Option<i64>) -> String {
    match course_id {
        Some(id) => format!(" for course {}", id),
        None => String::new(),
    }
}

impl ChatError {
    /// Map a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if (500..600).contains(&status) {
            ChatError::Server { status, body }
        } else {
            ChatError::ServerRejection { status, body }
        }
    }

    /// Network-level failures and 5xx responses are worth another attempt.
    /// Everything else (4xx, auth, malformed payloads) is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Transport(_) => true,
            ChatError::Server { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::ServerRejection { status, .. } | ChatError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ChatError::from_status(status.as_u16(), err.to_string()),
            None => ChatError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
