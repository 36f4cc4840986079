// Streaming transport over a WebSocket
// Contains connect, reconnect supervision, inbound frame dispatch and ack matching

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::frames::{decode_frame, encode_message, InboundEvent, InboundFrame};
use super::{ConnectionState, Transport};
use crate::auth::CredentialProvider;
use crate::config::EngineConfig;
use crate::error::{ChatError, Result};
use crate::events::{ConnectionChangedEvent, EventBus};
use crate::models::{Ack, OutboundMessage};
use crate::retry::BackoffPolicy;

/// How one connection session ended, which decides whether to reconnect.
#[derive(Debug, Clone, PartialEq)]
enum SessionEnd {
    Unauthenticated,
    NormalClose,
    Shutdown,
    Abnormal,
}

pub struct StreamingTransport {
    url: String,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<EventBus>,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    ack_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    pending_acks: Arc<TokioMutex<HashMap<String, oneshot::Sender<Ack>>>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    reconnect_attempts: AtomicU32,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
}

impl StreamingTransport {
    pub fn new(
        url: impl Into<String>,
        config: &EngineConfig,
        credentials: Arc<dyn CredentialProvider>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            url: url.into(),
            credentials,
            events,
            policy: BackoffPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            ack_timeout: config.ack_timeout(),
            state,
            writer: Mutex::new(None),
            pending_acks: Arc::new(TokioMutex::new(HashMap::new())),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            reconnect_attempts: AtomicU32::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState, detail: impl Into<String>) {
        let detail = detail.into();
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Stream connection {:?} -> {:?}: {}", previous, state, detail);
        }
        self.events
            .emit_connection_changed(&ConnectionChangedEvent { state, detail });
    }

    /// Inbound events from this connection instance. Can be taken once.
    pub fn subscribe(&self) -> Option<UnboundedReceiverStream<InboundEvent>> {
        match self.inbound_rx.lock() {
            Ok(mut guard) => guard.take().map(UnboundedReceiverStream::new),
            Err(e) => {
                error!("Inbound receiver lock poisoned: {}", e);
                None
            }
        }
    }

    /// Start the connection supervisor. Never fails; progress is reported through
    /// `ConnectionState` and `connectionChanged` events.
    pub fn connect(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Stream supervisor already running");
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move { this.supervise().await }))
    }

    /// Wait until the connection reaches `target` or the timeout passes.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        info!("Closing stream connection");
        self.closed.store(true, Ordering::SeqCst);
        if let Some(writer) = self.take_writer() {
            let _ = writer.send(WsMessage::Close(None));
        }
        self.shutdown.notify_waiters();
        // Leave Connected before waking ack waiters so their sends fail over
        if self.state() != ConnectionState::Unauthenticated {
            self.set_state(ConnectionState::Disconnected, "closed by client");
        }
        self.fail_pending_acks().await;
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let end = self.run_session().await;
            match end {
                SessionEnd::Unauthenticated | SessionEnd::NormalClose | SessionEnd::Shutdown => {
                    debug!("Stream supervisor stopping after {:?}", end);
                    break;
                }
                SessionEnd::Abnormal => {}
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.policy.max_attempts {
                error!(
                    "Giving up on stream after {} reconnect attempts; request/response transport stays in use",
                    self.policy.max_attempts
                );
                self.set_state(ConnectionState::Failed, "reconnect attempts exhausted");
                break;
            }

            let backoff = self.policy.delay_for(attempt);
            info!(
                "Reconnecting stream in {:?} (attempt {}/{})",
                backoff, attempt, self.policy.max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {},
                _ = self.shutdown.notified() => break,
            }
        }
        self.started.store(false, Ordering::SeqCst);
    }

    async fn run_session(&self) -> SessionEnd {
        let token = match self.credentials.token() {
            Some(token) if !token.trim().is_empty() => token,
            _ => {
                warn!("No credential available, not opening stream");
                self.set_state(ConnectionState::Unauthenticated, "no auth credential");
                return SessionEnd::Unauthenticated;
            }
        };

        self.set_state(ConnectionState::Connecting, format!("connecting to {}", self.url));

        let mut request = match self.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                error!("Invalid stream URL {}: {}", self.url, e);
                self.set_state(ConnectionState::Failed, format!("invalid stream URL: {}", e));
                return SessionEnd::Abnormal;
            }
        };
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => {
                request.headers_mut().insert("Authorization", value);
            }
            Err(e) => {
                error!("Credential is not a valid header value: {}", e);
                self.set_state(ConnectionState::Failed, "credential is not a valid header value");
                return SessionEnd::Abnormal;
            }
        }

        let socket = match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                error!("Stream connection failed: {}", e);
                self.set_state(ConnectionState::Failed, format!("connection failed: {}", e));
                return SessionEnd::Abnormal;
            }
            Err(_) => {
                error!("Stream connection timed out after {:?}", self.connect_timeout);
                self.set_state(
                    ConnectionState::TimedOut,
                    format!("no open within {:?}", self.connect_timeout),
                );
                return SessionEnd::Abnormal;
            }
        };

        let (mut sink, mut source) = socket.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WsMessage>();
        if let Ok(mut writer) = self.writer.lock() {
            *writer = Some(writer_tx);
        }
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    warn!("Stream write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let opened = Instant::now();
        self.set_state(ConnectionState::Connected, "stream open");

        let end = loop {
            if self.closed.load(Ordering::SeqCst) {
                break SessionEnd::Shutdown;
            }
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = self.shutdown.notified() => break SessionEnd::Shutdown,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => self.handle_text(&text).await,
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_text(&text).await,
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    info!("Stream closed by server: {}", reason);
                    self.set_state(ConnectionState::Disconnected, format!("closed: {}", reason));
                    break if normal {
                        SessionEnd::NormalClose
                    } else {
                        SessionEnd::Abnormal
                    };
                }
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                Some(Err(e)) => {
                    error!("Stream error: {}", e);
                    self.set_state(ConnectionState::Failed, format!("transport error: {}", e));
                    break SessionEnd::Abnormal;
                }
                None => {
                    warn!("Stream ended without a close frame");
                    self.set_state(ConnectionState::Disconnected, "stream ended");
                    break SessionEnd::Abnormal;
                }
            }
        };

        self.take_writer();
        self.fail_pending_acks().await;
        // A session that dies right after the handshake still counts against the budget
        if opened.elapsed() >= self.connect_timeout {
            self.reconnect_attempts.store(0, Ordering::SeqCst);
        }
        end
    }

    async fn handle_text(&self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frames never take the connection down
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };
        match frame {
            InboundFrame::Ack(ack) => {
                let waiter = self.pending_acks.lock().await.remove(&ack.message_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => debug!("Ack for unknown message {}", ack.message_id),
                }
            }
            InboundFrame::Message(message) => self.forward(InboundEvent::Message(message)),
            InboundFrame::Typing { user_id, typing } => {
                self.forward(InboundEvent::Typing { user_id, typing })
            }
            InboundFrame::UserStatus { user_id, status } => {
                self.forward(InboundEvent::UserStatus { user_id, status })
            }
            InboundFrame::Unknown(_) => {}
        }
    }

    fn forward(&self, event: InboundEvent) {
        if self.inbound_tx.send(event).is_err() {
            debug!("No inbound subscriber, dropping event");
        }
    }

    fn take_writer(&self) -> Option<mpsc::UnboundedSender<WsMessage>> {
        self.writer.lock().ok().and_then(|mut w| w.take())
    }

    async fn fail_pending_acks(&self) {
        let mut pending = self.pending_acks.lock().await;
        if !pending.is_empty() {
            warn!("Connection gone with {} unacknowledged sends", pending.len());
        }
        // Dropping the senders wakes each waiter with an error
        pending.clear();
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Ack> {
        let writer = self
            .writer
            .lock()
            .ok()
            .and_then(|w| w.clone())
            .ok_or_else(|| ChatError::Transport("stream not connected".into()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(message.id.clone(), ack_tx);

        debug!("Sending message {} over stream", message.id);
        if writer.send(WsMessage::Text(encode_message(message))).is_err() {
            self.pending_acks.lock().await.remove(&message.id);
            return Err(ChatError::Transport("stream writer closed".into()));
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ChatError::Transport(
                "connection closed before acknowledgment".into(),
            )),
            Err(_) => {
                self.pending_acks.lock().await.remove(&message.id);
                Err(ChatError::Transport(format!(
                    "no acknowledgment within {:?}",
                    self.ack_timeout
                )))
            }
        }
    }
}
