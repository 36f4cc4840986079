// HTTP client for the course backend
// Request/response fallback transport, user directory, course metadata and conversation endpoints

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{require_auth, CredentialProvider};
use crate::config::EngineConfig;
use crate::error::{ChatError, Result};
use crate::identity::UserDirectory;
use crate::models::{
    parse_timestamp, Ack, Conversation, CourseDetails, DirectoryUser, InboundMessage,
    OutboundMessage,
};
use crate::transport::Transport;

pub struct ApiClient {
    api_base: String,
    user_api_base: String,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(config: &EngineConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            user_api_base: config.user_api_base.trim_end_matches('/').to_string(),
            http,
            credentials,
        })
    }

    fn url(base: &str, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(base).map_err(|e| ChatError::Config(format!("{}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| ChatError::Config(format!("{} cannot be a base URL", base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn chat_url(&self, segments: &[&str]) -> Result<Url> {
        Self::url(&self.api_base, segments)
    }

    fn user_url(&self, segments: &[&str]) -> Result<Url> {
        Self::url(&self.user_api_base, segments)
    }

    fn bearer(&self) -> Result<String> {
        let (token, _user) = require_auth(self.credentials.as_ref())?;
        Ok(format!("Bearer {}", token))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let auth = self.bearer()?;
        debug!("GET {}", url);
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await?;
        Self::handle_json_response(resp).await
    }

    async fn post_json<TReq: Serialize>(&self, url: Url, body: &TReq) -> Result<Value> {
        let auth = self.bearer()?;
        debug!("POST {}", url);
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ChatError::from_status(status.as_u16(), text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // Some endpoints answer with plain text on success
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn handle_json_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), body));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// POST send-message with the `{receiverId, courseId, content}` body.
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<Ack> {
        let payload = message.payload();
        if payload.receiver_id.trim().is_empty() || payload.content.trim().is_empty() {
            return Err(ChatError::Validation(
                "receiverId, courseId, and content are required".into(),
            ));
        }

        info!(
            "Sending message {} to {} (course {}) over HTTP",
            message.id, payload.receiver_id, payload.course_id
        );
        let response = self.post_json(self.chat_url(&["send-message"])?, &payload).await?;

        let server_timestamp = ["timestamp", "sentAt", "serverTimestamp"]
            .iter()
            .find_map(|field| response.get(*field).and_then(parse_timestamp))
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        Ok(Ack {
            message_id: message.id.clone(),
            server_timestamp,
        })
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.get_json(self.chat_url(&["conversations"])?).await
    }

    pub async fn messages(&self, other_user_id: &str, course_id: i64) -> Result<Vec<InboundMessage>> {
        let course = course_id.to_string();
        self.get_json(self.chat_url(&["messages", other_user_id, &course])?)
            .await
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        let body = serde_json::json!({ "messageId": message_id });
        self.post_json(self.chat_url(&["mark-as-read"])?, &body).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for ApiClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Ack> {
        self.send_message(message).await.map_err(|e| {
            error!("HTTP send of {} failed: {}", message.id, e);
            e
        })
    }
}

#[async_trait]
impl UserDirectory for ApiClient {
    async fn list_users(&self) -> Result<Vec<DirectoryUser>> {
        let users: Vec<DirectoryUser> = self.get_json(self.user_url(&["Admin", "GetUsers"])?).await?;
        debug!("Directory returned {} users", users.len());
        Ok(users)
    }

    async fn lookup_user(&self, name: &str, role: Option<&str>) -> Result<Option<DirectoryUser>> {
        let mut url = self.user_url(&["User", "lookup"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("name", name);
            if let Some(role) = role {
                query.append_pair("role", role);
            }
        }
        match self.get_json::<DirectoryUser>(url).await {
            Ok(user) => Ok(Some(user)),
            Err(ChatError::ServerRejection { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn course_details(&self, course_id: i64) -> Result<CourseDetails> {
        let course = course_id.to_string();
        let details: CourseDetails = self.get_json(self.user_url(&["Course", &course])?).await?;
        if details.instructor_id().is_none() && details.instructor_name().is_none() {
            warn!("Course {} has no instructor information", course_id);
        }
        Ok(details)
    }
}
