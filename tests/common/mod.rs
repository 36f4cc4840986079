// Common test utilities for integration tests
// Scripted transports, in-memory collaborators and fake servers shared by all test files
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, LevelFilter};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use coursechat::conversations::ConversationSource;
use coursechat::identity::UserDirectory;
use coursechat::transport::Transport;
use coursechat::{
    Ack, ChatEngine, ChatError, Conversation, CourseDetails, CurrentUser, DirectoryUser,
    EngineConfig, EngineEvent, InboundMessage, OutboundMessage, Result, StaticCredentials,
};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Config with delays small enough for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        api_base: "http://127.0.0.1:9/api/Chat".into(),
        user_api_base: "http://127.0.0.1:9/api".into(),
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        retry_jitter_ms: 0,
        connect_timeout_ms: 2_000,
        ack_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// Unsigned JWT-shaped token carrying `claims`.
pub fn make_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, body)
}

pub fn signed_in() -> Arc<StaticCredentials> {
    signed_in_with(&json!({ "sub": "100" }))
}

pub fn signed_in_with(claims: &Value) -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::new(
        Some(make_token(claims)),
        Some(CurrentUser {
            id: Some("100".into()),
            name: Some("Test Student".into()),
        }),
    ))
}

//------------------------------------------------------------------------------
// SCRIPTED TRANSPORT
//------------------------------------------------------------------------------

/// Outcome of one send attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    Ack(i64),
    Fail(ChatError),
}

/// Transport answering each send from a script; acks at 1000 once the script runs out.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Attempt>>,
    sent: Mutex<Vec<OutboundMessage>>,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Attempt>) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    pub fn with_delay(script: Vec<Attempt>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn always_failing(error: ChatError, times: usize) -> Arc<Self> {
        Self::new(vec![Attempt::Fail(error); times])
    }

    pub fn attempts(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Ack> {
        self.sent.lock().unwrap().push(message.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or(Attempt::Ack(1000)) {
            Attempt::Ack(ts) => Ok(Ack {
                message_id: message.id.clone(),
                server_timestamp: ts,
            }),
            Attempt::Fail(e) => Err(e),
        }
    }
}

//------------------------------------------------------------------------------
// IN-MEMORY COLLABORATORS
//------------------------------------------------------------------------------

#[derive(Default)]
pub struct MockDirectory {
    pub users: Vec<DirectoryUser>,
    pub lookups: HashMap<String, DirectoryUser>,
    pub course: Option<CourseDetails>,
    pub fail_list: bool,
    pub list_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
    pub course_calls: AtomicUsize,
}

impl MockDirectory {
    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
            + self.lookup_calls.load(Ordering::SeqCst)
            + self.course_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for MockDirectory {
    async fn list_users(&self) -> Result<Vec<DirectoryUser>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(ChatError::Transport("directory unreachable".into()));
        }
        Ok(self.users.clone())
    }

    async fn lookup_user(&self, name: &str, _role: Option<&str>) -> Result<Option<DirectoryUser>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookups.get(name).cloned())
    }

    async fn course_details(&self, course_id: i64) -> Result<CourseDetails> {
        self.course_calls.fetch_add(1, Ordering::SeqCst);
        self.course
            .clone()
            .ok_or_else(|| ChatError::from_status(404, format!("course {} not found", course_id)))
    }
}

#[derive(Default)]
pub struct MockConversations {
    pub conversations: Vec<Conversation>,
    pub history: Vec<InboundMessage>,
    pub failing_mark_read: Vec<String>,
    pub marked: Mutex<Vec<String>>,
    pub load_calls: AtomicUsize,
}

impl MockConversations {
    pub fn marked(&self) -> Vec<String> {
        let mut marked = self.marked.lock().unwrap().clone();
        marked.sort();
        marked
    }
}

#[async_trait]
impl ConversationSource for MockConversations {
    async fn load_conversations(&self, _force_refresh: bool) -> Result<Vec<Conversation>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.conversations.clone())
    }

    async fn load_messages(&self, _other_user_id: &str, _course_id: i64) -> Result<Vec<InboundMessage>> {
        Ok(self.history.clone())
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        if self.failing_mark_read.iter().any(|id| id == message_id) {
            return Err(ChatError::from_status(500, "mark failed"));
        }
        self.marked.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

pub fn directory_user(id: &str, full_name: &str) -> DirectoryUser {
    DirectoryUser {
        id: Some(id.into()),
        full_name: Some(full_name.into()),
        ..Default::default()
    }
}

pub fn conversation(other_user_id: &str, other_user_name: &str, course_id: i64) -> Conversation {
    Conversation {
        other_user_id: other_user_id.into(),
        other_user_name: other_user_name.into(),
        course_id,
        ..Default::default()
    }
}

/// Engine wired to in-memory collaborators.
pub struct Harness {
    pub engine: ChatEngine,
    pub transport: Arc<ScriptedTransport>,
    pub directory: Arc<MockDirectory>,
    pub conversations: Arc<MockConversations>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

pub fn harness(transport: Arc<ScriptedTransport>) -> Harness {
    harness_with(
        test_config(),
        signed_in(),
        transport,
        MockDirectory::default(),
        MockConversations::default(),
    )
}

pub fn harness_with(
    config: EngineConfig,
    credentials: Arc<StaticCredentials>,
    transport: Arc<ScriptedTransport>,
    directory: MockDirectory,
    conversations: MockConversations,
) -> Harness {
    let directory = Arc::new(directory);
    let conversations = Arc::new(conversations);
    let engine = ChatEngine::builder(config, credentials)
        .fallback(transport.clone())
        .directory(directory.clone())
        .conversations(conversations.clone())
        .build()
        .expect("engine builds");
    let events = engine.events().subscribe_all();
    Harness {
        engine,
        transport,
        directory,
        conversations,
        events,
    }
}

/// Collect events until `done` returns true for one of them, or the timeout passes.
pub async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    timeout: Duration,
    mut done: impl FnMut(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    seen
}

/// True once `id` was acknowledged or failed for good.
pub fn is_terminal_for(id: &str) -> impl Fn(&EngineEvent) -> bool + '_ {
    move |event| match event {
        EngineEvent::MessageSent(e) => e.message.id == id && !e.optimistic,
        EngineEvent::MessageError(e) => e.message_id == id && e.status.is_terminal(),
        _ => false,
    }
}

//------------------------------------------------------------------------------
// FAKE SERVERS
//------------------------------------------------------------------------------

/// Serve `app` on an ephemeral port and return its base URL.
pub async fn spawn_backend(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// How the fake stream server treats each connection.
#[derive(Debug, Clone)]
pub enum StreamBehavior {
    /// Send these frames after the handshake, then ack every message frame at this timestamp.
    Ack { greeting: Vec<String>, timestamp: i64 },
    /// Accept the handshake and close immediately with this code.
    CloseWith(CloseCode),
    /// Accept the handshake and close with a frame that carries no status code.
    CloseWithout,
    /// Accept, record what arrives and never answer.
    Silent,
}

pub struct FakeStreamServer {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub auth_headers: Arc<Mutex<Vec<Option<String>>>>,
    pub received: Arc<Mutex<Vec<Value>>>,
}

pub async fn spawn_stream_server(behavior: StreamBehavior) -> FakeStreamServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let auth_headers = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));

    let (conn_count, headers, frames) = (connections.clone(), auth_headers.clone(), received.clone());
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            conn_count.fetch_add(1, Ordering::SeqCst);
            let headers = headers.clone();
            let frames = frames.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                    let auth = req
                        .headers()
                        .get("Authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    headers.lock().unwrap().push(auth);
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                    return;
                };
                serve_connection(ws, behavior, frames).await;
            });
        }
    });

    info!("Fake stream server listening on {}", addr);
    FakeStreamServer {
        url: format!("ws://{}/ws", addr),
        connections,
        auth_headers,
        received,
    }
}

/// Accepts TCP connections and holds them without ever answering the handshake.
pub async fn spawn_stalled_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let count = connections.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _held = tcp;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    (format!("ws://{}/ws", addr), connections)
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    behavior: StreamBehavior,
    received: Arc<Mutex<Vec<Value>>>,
) {
    let (mut sink, mut source) = ws.split();
    match behavior {
        StreamBehavior::CloseWith(code) => {
            let _ = sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code,
                    reason: "test close".into(),
                })))
                .await;
        }
        StreamBehavior::CloseWithout => {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        StreamBehavior::Silent => {
            while let Some(Ok(frame)) = source.next().await {
                if let WsMessage::Text(text) = frame {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        received.lock().unwrap().push(value);
                    }
                }
            }
        }
        StreamBehavior::Ack { greeting, timestamp } => {
            for frame in greeting {
                if sink.send(WsMessage::Text(frame)).await.is_err() {
                    return;
                }
            }
            while let Some(Ok(frame)) = source.next().await {
                let WsMessage::Text(text) = frame else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                received.lock().unwrap().push(value.clone());
                if value["type"] == "message" {
                    let ack = json!({
                        "type": "ack",
                        "payload": { "messageId": value["payload"]["id"], "serverTimestamp": timestamp }
                    });
                    debug!("Fake stream acking {}", value["payload"]["id"]);
                    if sink.send(WsMessage::Text(ack.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
