// Credential access for the engine
// The engine only reads credentials; storing and refreshing them is the host's job

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::{debug, warn};
use serde_json::Value;
use std::sync::RwLock;

use crate::error::{ChatError, Result};
use crate::models::CurrentUser;

/// Supplies the bearer credential and the signed-in user.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn current_user(&self) -> Option<CurrentUser>;
}

/// Credentials held in memory, swappable at runtime (login/logout).
#[derive(Default)]
pub struct StaticCredentials {
    inner: RwLock<(Option<String>, Option<CurrentUser>)>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>, user: Option<CurrentUser>) -> Self {
        Self {
            inner: RwLock::new((token, user)),
        }
    }

    pub fn set(&self, token: Option<String>, user: Option<CurrentUser>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = (token, user),
            Err(e) => warn!("Credential lock poisoned: {}", e),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.inner.read().ok().and_then(|guard| guard.0.clone())
    }

    fn current_user(&self) -> Option<CurrentUser> {
        self.inner.read().ok().and_then(|guard| guard.1.clone())
    }
}

/// Both a token and a user must be present before any authenticated network call.
pub fn require_auth(credentials: &dyn CredentialProvider) -> Result<(String, CurrentUser)> {
    match (credentials.token(), credentials.current_user()) {
        (Some(token), Some(user)) if !token.trim().is_empty() => Ok((token, user)),
        _ => Err(ChatError::AuthRequired),
    }
}

/// Decode the payload segment of a `header.payload.signature` bearer token.
/// The signature is not checked; the server does that.
pub fn decode_claims(token: &str) -> Option<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        debug!("Bearer token is not a three-part JWT");
        return None;
    }

    // Tolerate padded and standard-alphabet payloads as well
    let normalized: String = parts[1]
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = match URL_SAFE_NO_PAD.decode(normalized.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to decode token payload: {}", e);
            return None;
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => {
            warn!("Token payload is not a JSON object");
            None
        }
        Err(e) => {
            warn!("Token payload is not valid JSON: {}", e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) fn make_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{}.{}.signature", header, payload)
}
