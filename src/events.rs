// Event dispatcher decoupling the engine from its UI consumer
// One typed channel per event kind; emission is synchronous and in subscription order

use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::models::{InboundMessage, Message, MessageStatus};
use crate::transport::ConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSentEvent {
    pub message: Message,
    /// True for the immediate local echo, false once the server acknowledged it.
    pub optimistic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageErrorEvent {
    pub message_id: String,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionChangedEvent {
    pub state: ConnectionState,
    pub detail: String,
}

/// All four kinds folded together, for consumers that prefer a single channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MessageReceived(InboundMessage),
    MessageSent(MessageSentEvent),
    MessageError(MessageErrorEvent),
    ConnectionChanged(ConnectionChangedEvent),
}

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Channel<T> {
    name: &'static str,
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Channel<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn subscribe(&self, handler: Handler<T>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(e) => error!("Failed to subscribe to {}: {}", self.name, e),
        }
    }

    fn emit(&self, payload: &T) {
        // Snapshot so handlers may subscribe from inside a callback
        let handlers: Vec<Handler<T>> = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(e) => {
                error!("Failed to read {} handlers: {}", self.name, e);
                return;
            }
        };

        for (index, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!("{} handler #{} panicked; continuing with remaining handlers", self.name, index);
            }
        }
    }

    fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }
}

pub struct EventBus {
    message_received: Channel<InboundMessage>,
    message_sent: Channel<MessageSentEvent>,
    message_error: Channel<MessageErrorEvent>,
    connection_changed: Channel<ConnectionChangedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            message_received: Channel::new("messageReceived"),
            message_sent: Channel::new("messageSent"),
            message_error: Channel::new("messageError"),
            connection_changed: Channel::new("connectionChanged"),
        }
    }

    pub fn on_message_received(&self, handler: impl Fn(&InboundMessage) + Send + Sync + 'static) {
        self.message_received.subscribe(Arc::new(handler));
    }

    pub fn on_message_sent(&self, handler: impl Fn(&MessageSentEvent) + Send + Sync + 'static) {
        self.message_sent.subscribe(Arc::new(handler));
    }

    pub fn on_message_error(&self, handler: impl Fn(&MessageErrorEvent) + Send + Sync + 'static) {
        self.message_error.subscribe(Arc::new(handler));
    }

    pub fn on_connection_changed(
        &self,
        handler: impl Fn(&ConnectionChangedEvent) + Send + Sync + 'static,
    ) {
        self.connection_changed.subscribe(Arc::new(handler));
    }

    /// Forward every event kind into one unbounded channel.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let sender = tx.clone();
        self.on_message_received(move |m| {
            let _ = sender.send(EngineEvent::MessageReceived(m.clone()));
        });
        let sender = tx.clone();
        self.on_message_sent(move |e| {
            let _ = sender.send(EngineEvent::MessageSent(e.clone()));
        });
        let sender = tx.clone();
        self.on_message_error(move |e| {
            let _ = sender.send(EngineEvent::MessageError(e.clone()));
        });
        self.on_connection_changed(move |e| {
            let _ = tx.send(EngineEvent::ConnectionChanged(e.clone()));
        });

        rx
    }

    pub fn emit_message_received(&self, message: &InboundMessage) {
        debug!("Emitting messageReceived from {:?}", message.sender_id);
        self.message_received.emit(message);
    }

    pub fn emit_message_sent(&self, event: &MessageSentEvent) {
        debug!(
            "Emitting messageSent for {} (optimistic: {})",
            event.message.id, event.optimistic
        );
        self.message_sent.emit(event);
    }

    pub fn emit_message_error(&self, event: &MessageErrorEvent) {
        debug!("Emitting messageError for {} ({:?})", event.message_id, event.status);
        self.message_error.emit(event);
    }

    pub fn emit_connection_changed(&self, event: &ConnectionChangedEvent) {
        debug!("Emitting connectionChanged: {:?}", event.state);
        self.connection_changed.emit(event);
    }

    pub fn handler_count(&self) -> usize {
        self.message_received.len()
            + self.message_sent.len()
            + self.message_error.len()
            + self.connection_changed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn error_event(id: &str) -> MessageErrorEvent {
        MessageErrorEvent {
            message_id: id.to_string(),
            status: MessageStatus::Retrying,
            retry_count: 1,
            error: Some("HTTP 503".into()),
        }
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            bus.on_message_error(move |e| seen.lock().unwrap().push((n, e.message_id.clone())));
        }
        bus.emit_message_error(&error_event("m1"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(0, "m1".to_string()), (1, "m1".to_string()), (2, "m1".to_string())]
        );
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));

        let c = count.clone();
        bus.on_message_error(move |_| *c.lock().unwrap() += 1);
        bus.on_message_error(|_| panic!("handler blew up"));
        let c = count.clone();
        bus.on_message_error(move |_| *c.lock().unwrap() += 1);

        bus.emit_message_error(&error_event("m1"));
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_channels_are_independent() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        assert_eq!(bus.handler_count(), 4);

        bus.emit_connection_changed(&ConnectionChangedEvent {
            state: ConnectionState::Connecting,
            detail: "opening".into(),
        });
        bus.emit_message_error(&error_event("m2"));

        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::ConnectionChanged(ConnectionChangedEvent { state: ConnectionState::Connecting, .. }))
        ));
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::MessageError(e)) if e.message_id == "m2"));
        assert!(rx.try_recv().is_err());
    }
}
