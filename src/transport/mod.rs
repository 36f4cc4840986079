// Transport layer
// A preferred streaming connection plus an always-available request/response fallback

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

use crate::error::{ChatError, Result};
use crate::models::{Ack, OutboundMessage};

pub mod frames;
pub mod stream;

pub use frames::{InboundEvent, InboundFrame};
pub use stream::StreamingTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Connecting,
    Connected,
    Disconnected,
    TimedOut,
    Failed,
}

/// One way of getting an outbound message to the server and an ack back.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a send right now has a chance. Fallback transports are always ready.
    fn is_ready(&self) -> bool {
        true
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Ack>;
}

pub struct TransportLayer {
    preferred: Option<Arc<dyn Transport>>,
    fallback: Arc<dyn Transport>,
}

impl TransportLayer {
    pub fn new(preferred: Option<Arc<dyn Transport>>, fallback: Arc<dyn Transport>) -> Self {
        Self { preferred, fallback }
    }

    /// Send over the stream when it is connected, otherwise over the fallback.
    /// A stream that drops mid-send hands the attempt to the fallback; whatever the
    /// transport that ran last reports is the outcome.
    pub async fn send(&self, message: &OutboundMessage) -> Result<Ack> {
        if let Some(preferred) = &self.preferred {
            if preferred.is_ready() {
                match preferred.send(message).await {
                    Ok(ack) => return Ok(ack),
                    Err(ChatError::Transport(e)) if !preferred.is_ready() => {
                        warn!(
                            "{} transport dropped while sending {} ({}), failing over to {}",
                            preferred.name(),
                            message.id,
                            e,
                            self.fallback.name()
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else {
                debug!(
                    "{} transport not connected, sending {} via {}",
                    preferred.name(),
                    message.id,
                    self.fallback.name()
                );
            }
        }
        self.fallback.send(message).await
    }
}
