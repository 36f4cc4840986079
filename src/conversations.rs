// Conversation sync collaborator
// Supplies the conversation list (used as a resolution fallback), history and read receipts

use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::api::ApiClient;
use crate::error::Result;
use crate::models::{Conversation, InboundMessage};

#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// Cached list unless `force_refresh` or nothing has been loaded yet.
    async fn load_conversations(&self, force_refresh: bool) -> Result<Vec<Conversation>>;

    async fn load_messages(&self, other_user_id: &str, course_id: i64) -> Result<Vec<InboundMessage>>;

    async fn mark_read(&self, message_id: &str) -> Result<()>;
}

/// HTTP-backed conversation sync with an in-memory list cache.
pub struct ConversationSync {
    api: Arc<ApiClient>,
    cached: TokioMutex<Vec<Conversation>>,
}

impl ConversationSync {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            cached: TokioMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ConversationSource for ConversationSync {
    async fn load_conversations(&self, force_refresh: bool) -> Result<Vec<Conversation>> {
        let mut cached = self.cached.lock().await;
        if !force_refresh && !cached.is_empty() {
            debug!("Using {} cached conversations", cached.len());
            return Ok(cached.clone());
        }

        let conversations = self.api.conversations().await.map_err(|e| {
            error!("Error loading conversations: {}", e);
            e
        })?;
        info!("Loaded {} conversations", conversations.len());
        *cached = conversations.clone();
        Ok(conversations)
    }

    async fn load_messages(&self, other_user_id: &str, course_id: i64) -> Result<Vec<InboundMessage>> {
        self.api.messages(other_user_id, course_id).await
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        self.api.mark_read(message_id).await
    }
}
