// Chat engine
// Submit, delivery, retry scheduling and the query surface used by the UI

use futures::future::{join_all, BoxFuture};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as TokioMutex;

use crate::api::ApiClient;
use crate::auth::{require_auth, CredentialProvider};
use crate::config::EngineConfig;
use crate::conversations::{ConversationSource, ConversationSync};
use crate::error::{ChatError, Result};
use crate::events::{ConnectionChangedEvent, EventBus, MessageErrorEvent, MessageSentEvent};
use crate::identity::{ClaimInspector, IdentityResolver, UserDirectory};
use crate::models::{
    Conversation, InboundMessage, Message, MessageStatus, PresenceInfo, ResolvedUser,
};
use crate::retry::BackoffPolicy;
use crate::transport::{ConnectionState, InboundEvent, StreamingTransport, Transport, TransportLayer};

pub mod store;

pub use store::{FailureOutcome, MessageStore};

/// `msg_<millis>_<9 base36 chars>`
pub fn generate_message_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("msg_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

pub struct ChatEngineBuilder {
    config: EngineConfig,
    credentials: Arc<dyn CredentialProvider>,
    events: Option<Arc<EventBus>>,
    fallback: Option<Arc<dyn Transport>>,
    directory: Option<Arc<dyn UserDirectory>>,
    conversations: Option<Arc<dyn ConversationSource>>,
    claims: Option<ClaimInspector>,
}

impl ChatEngineBuilder {
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the HTTP request/response transport.
    pub fn fallback(mut self, transport: Arc<dyn Transport>) -> Self {
        self.fallback = Some(transport);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn conversations(mut self, conversations: Arc<dyn ConversationSource>) -> Self {
        self.conversations = Some(conversations);
        self
    }

    /// Replace the claim rules derived from `claim_fields`.
    pub fn claims(mut self, claims: ClaimInspector) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn build(self) -> Result<ChatEngine> {
        self.config.validate()?;
        let config = self.config;
        let credentials = self.credentials;
        let events = self.events.unwrap_or_default();

        let needs_api =
            self.fallback.is_none() || self.directory.is_none() || self.conversations.is_none();
        let api = if needs_api {
            Some(Arc::new(ApiClient::new(&config, credentials.clone())?))
        } else {
            None
        };

        let fallback: Arc<dyn Transport> = match self.fallback {
            Some(fallback) => fallback,
            None => required(&api)? as Arc<dyn Transport>,
        };
        let directory: Arc<dyn UserDirectory> = match self.directory {
            Some(directory) => directory,
            None => required(&api)? as Arc<dyn UserDirectory>,
        };
        let conversations: Arc<dyn ConversationSource> = match self.conversations {
            Some(conversations) => conversations,
            None => Arc::new(ConversationSync::new(required(&api)?)),
        };

        let stream = config.stream_url.as_ref().map(|url| {
            StreamingTransport::new(url.clone(), &config, credentials.clone(), events.clone())
        });
        let transport = TransportLayer::new(
            stream.clone().map(|s| s as Arc<dyn Transport>),
            fallback,
        );

        let claims = self
            .claims
            .unwrap_or_else(|| ClaimInspector::from_fields(&config.claim_fields));
        let resolver = IdentityResolver::new(
            config.resolution_order.clone(),
            claims,
            config.identity_cache_ttl(),
            credentials.clone(),
            directory,
            conversations.clone(),
        );

        info!(
            "Chat engine ready (streaming: {}, resolution order: {:?})",
            stream.is_some(),
            config.resolution_order
        );

        Ok(ChatEngine {
            inner: Arc::new(EngineInner {
                policy: BackoffPolicy::from_config(&config),
                config,
                credentials,
                events,
                resolver,
                transport,
                stream,
                conversations,
                store: TokioMutex::new(MessageStore::new()),
                presence: TokioMutex::new(HashMap::new()),
                course_titles: TokioMutex::new(HashMap::new()),
            }),
        })
    }
}

fn required(api: &Option<Arc<ApiClient>>) -> Result<Arc<ApiClient>> {
    api.clone()
        .ok_or_else(|| ChatError::Config("no API client for a missing collaborator".into()))
}

struct EngineInner {
    config: EngineConfig,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<EventBus>,
    resolver: IdentityResolver,
    transport: TransportLayer,
    stream: Option<Arc<StreamingTransport>>,
    conversations: Arc<dyn ConversationSource>,
    store: TokioMutex<MessageStore>,
    presence: TokioMutex<HashMap<String, PresenceInfo>>,
    course_titles: TokioMutex<HashMap<i64, String>>,
    policy: BackoffPolicy,
}

/// Cheap to clone; clones share one engine instance.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn builder(config: EngineConfig, credentials: Arc<dyn CredentialProvider>) -> ChatEngineBuilder {
        ChatEngineBuilder {
            config,
            credentials,
            events: None,
            fallback: None,
            directory: None,
            conversations: None,
            claims: None,
        }
    }

    /// Engine wired to the HTTP backend described by `config`.
    pub fn new(config: EngineConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Self::builder(config, credentials).build()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Open the streaming connection, if this engine has one, and start pumping
    /// its inbound events into the dispatcher.
    pub fn connect(&self) {
        let Some(stream) = &self.inner.stream else {
            self.inner.events.emit_connection_changed(&ConnectionChangedEvent {
                state: ConnectionState::Disconnected,
                detail: "streaming disabled, using request/response transport".into(),
            });
            return;
        };

        if let Some(mut inbound) = stream.subscribe() {
            let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                while let Some(event) = inbound.next().await {
                    match engine.upgrade() {
                        Some(inner) => inner.handle_inbound(event).await,
                        None => break,
                    }
                }
                debug!("Inbound event pump finished");
            });
        }
        stream.connect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        match &self.inner.stream {
            Some(stream) => stream.state(),
            None => ConnectionState::Disconnected,
        }
    }

    pub fn stream(&self) -> Option<Arc<StreamingTransport>> {
        self.inner.stream.clone()
    }

    pub async fn resolve(&self, identifier: &str, course_id: Option<i64>) -> Result<ResolvedUser> {
        self.inner.resolver.resolve(identifier, course_id).await
    }

    /// Queue a message and return its id without waiting for delivery.
    /// Resolution and validation failures are returned here; delivery outcomes
    /// only show up on the event stream.
    pub async fn submit(
        &self,
        receiver_ref: &str,
        course_id: i64,
        content: &str,
        id: Option<String>,
    ) -> Result<String> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("content is required".into()));
        }
        if receiver_ref.trim().is_empty() {
            return Err(ChatError::Validation("receiver is required".into()));
        }
        require_auth(self.inner.credentials.as_ref())?;

        info!("Sending message to \"{}\" (course {})", receiver_ref, course_id);
        let receiver = self.inner.resolver.resolve(receiver_ref, Some(course_id)).await?;

        let id = id.unwrap_or_else(generate_message_id);
        let message = Message::new(id.clone(), receiver.id.clone(), course_id, content.to_string());
        self.inner.store.lock().await.insert_pending(message.clone())?;

        self.inner.events.emit_message_sent(&MessageSentEvent {
            message,
            optimistic: true,
        });

        tokio::spawn(EngineInner::deliver(self.inner.clone(), id.clone()));
        Ok(id)
    }

    /// Submit the content of a terminally failed message again under a new id.
    pub async fn resend(&self, message_id: &str) -> Result<String> {
        let failed = {
            let store = self.inner.store.lock().await;
            let message = store
                .get(message_id)
                .ok_or_else(|| ChatError::UnknownMessage(message_id.to_string()))?;
            if message.status != MessageStatus::Failed {
                return Err(ChatError::Validation(format!(
                    "message {} is {:?}, only failed messages can be resent",
                    message_id, message.status
                )));
            }
            message.clone()
        };
        self.submit(&failed.receiver_id, failed.course_id, &failed.content, None)
            .await
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.inner.store.lock().await.get(id).cloned()
    }

    pub async fn status(&self, id: &str) -> Option<MessageStatus> {
        self.inner.store.lock().await.get(id).map(|m| m.status)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.store.lock().await.all()
    }

    pub async fn in_flight(&self) -> Vec<String> {
        self.inner.store.lock().await.in_flight()
    }

    pub async fn presence(&self, user_id: &str) -> PresenceInfo {
        self.inner
            .presence
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_typing(&self, user_id: &str) -> bool {
        self.presence(user_id).await.typing
    }

    /// Title learned from the conversation list.
    pub async fn course_title(&self, course_id: i64) -> Option<String> {
        self.inner.course_titles.lock().await.get(&course_id).cloned()
    }

    pub async fn load_conversations(&self, force_refresh: bool) -> Result<Vec<Conversation>> {
        require_auth(self.inner.credentials.as_ref())?;
        let conversations = self.inner.conversations.load_conversations(force_refresh).await?;
        self.inner.resolver.seed_from_conversations(&conversations).await;
        let mut titles = self.inner.course_titles.lock().await;
        for conv in conversations.iter().filter(|c| !c.course_title.is_empty()) {
            titles.insert(conv.course_id, conv.course_title.clone());
        }
        drop(titles);
        Ok(conversations)
    }

    /// Fetch history with another user. With `mark_read`, unread messages from
    /// them are marked read in the background.
    pub async fn load_messages(
        &self,
        other_user_id: &str,
        course_id: i64,
        mark_read: bool,
    ) -> Result<Vec<InboundMessage>> {
        require_auth(self.inner.credentials.as_ref())?;
        let messages = self
            .inner
            .conversations
            .load_messages(other_user_id, course_id)
            .await?;

        if mark_read {
            let unread: Vec<String> = messages
                .iter()
                .filter(|m| !m.is_read && !m.is_from_current_user)
                .filter_map(|m| m.id.clone())
                .collect();
            if !unread.is_empty() {
                let engine = self.clone();
                tokio::spawn(async move { engine.mark_read(&unread).await });
            }
        }
        Ok(messages)
    }

    /// One mark-read request per id; every id is attempted and failures are only logged.
    pub async fn mark_read(&self, message_ids: &[String]) {
        if message_ids.is_empty() {
            return;
        }
        if let Err(e) = require_auth(self.inner.credentials.as_ref()) {
            error!("Error marking messages as read: {}", e);
            return;
        }
        let requests = message_ids
            .iter()
            .map(|id| self.inner.conversations.mark_read(id));
        let results = join_all(requests).await;
        for (id, result) in message_ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to mark message {} as read: {}", id, e);
            }
        }
    }

    /// Close the stream and drop all session state.
    pub async fn shutdown(&self) {
        if let Some(stream) = &self.inner.stream {
            stream.shutdown().await;
        }
        self.inner.store.lock().await.clear();
        self.inner.presence.lock().await.clear();
        self.inner.course_titles.lock().await.clear();
        self.inner.resolver.clear().await;
        info!("Chat engine shut down");
    }
}

impl EngineInner {
    /// One delivery attempt for a pending message.
    fn deliver(self: Arc<Self>, id: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let outbound = {
                let store = self.store.lock().await;
                match store.get(&id) {
                    Some(message) if message.status == MessageStatus::Pending => message.outbound(),
                    Some(message) => {
                        debug!("Message {} is {:?}, not sending", id, message.status);
                        return;
                    }
                    None => return,
                }
            };

            match self.transport.send(&outbound).await {
                Ok(ack) => self.handle_ack(&id, ack.server_timestamp).await,
                Err(e) => self.handle_send_error(&id, e).await,
            }
        })
    }

    async fn handle_ack(&self, id: &str, server_timestamp: i64) {
        let sent = self.store.lock().await.mark_sent(id, server_timestamp);
        match sent {
            Some(message) => self.events.emit_message_sent(&MessageSentEvent {
                message,
                optimistic: false,
            }),
            None => debug!("Ack for message {} that is no longer in flight", id),
        }
    }

    async fn handle_send_error(self: &Arc<Self>, id: &str, error: ChatError) {
        let outcome = self.store.lock().await.record_failure(id, &error, &self.policy);

        match outcome {
            Some(FailureOutcome::Retrying { message, delay }) => {
                self.events.emit_message_error(&MessageErrorEvent {
                    message_id: message.id.clone(),
                    status: MessageStatus::Retrying,
                    retry_count: message.retry_count,
                    error: Some(error.to_string()),
                });
                let inner = self.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.retry_message(id).await;
                });
            }
            Some(FailureOutcome::Failed { message }) => {
                self.events.emit_message_error(&MessageErrorEvent {
                    message_id: message.id.clone(),
                    status: MessageStatus::Failed,
                    retry_count: message.retry_count,
                    error: Some(error.to_string()),
                });
            }
            None => debug!("Send error for message {} ignored: {}", id, error),
        }
    }

    /// Backoff timer callback. Inert unless the message is still retrying.
    async fn retry_message(self: Arc<Self>, id: String) {
        let resumed = self.store.lock().await.begin_retry(&id);
        let Some(message) = resumed else {
            return;
        };
        info!("Retrying message {} (retry {})", id, message.retry_count);
        self.events.emit_message_error(&MessageErrorEvent {
            message_id: id.clone(),
            status: MessageStatus::Pending,
            retry_count: message.retry_count,
            error: None,
        });
        self.deliver(id).await;
    }

    async fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.events.emit_message_received(&message),
            InboundEvent::Typing { user_id, typing } => {
                debug!("{} typing: {}", user_id, typing);
                self.presence.lock().await.entry(user_id).or_default().typing = typing;
            }
            InboundEvent::UserStatus { user_id, status } => {
                debug!("{} is now {:?}", user_id, status);
                self.presence.lock().await.entry(user_id).or_default().status = Some(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_format() {
        let id = generate_message_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3, "{}", id);
        assert_eq!(parts[0], "msg");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_message_id(), id);
    }
}
