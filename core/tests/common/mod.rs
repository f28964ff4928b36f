#![allow(dead_code)]
/// Shared fixtures: an in-process STOMP broker and a scriptable REST backend
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swipechat_core::error::{ChatError, Result};
use swipechat_core::transport::memory::{MemoryConnector, MemoryServer, ServerEnd};
use swipechat_core::transport::{Command, LinkEvent, StompFrame, TransportSession};
use swipechat_core::types::{ConversationSummary, Message};
use swipechat_core::{ChatApi, Config, Credential};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const TOKEN: &str = "valid-token";

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.reconnect_delay = Duration::from_millis(50);
    config.connect_timeout = Duration::from_secs(2);
    config.subscribe_wait = Duration::from_secs(2);
    config
}

pub fn msg(id: i64, content: &str) -> Message {
    Message {
        message_id: id,
        content: content.to_string(),
        written_by: "2".to_string(),
        timestamp: 1_700_000_000_000 + id,
    }
}

pub fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|m| m.message_id).collect()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Default)]
struct BrokerState {
    connections: usize,
    /// Sender towards the client of the live connection
    client: Option<mpsc::Sender<LinkEvent>>,
    /// subscription id -> destination on the live connection
    subscriptions: HashMap<String, String>,
    unsubscribes: Vec<String>,
    published: Vec<StompFrame>,
    next_message_id: i64,
}

impl BrokerState {
    fn deliver(&mut self, destination: &str, body: &str) {
        let Some(client) = &self.client else {
            return;
        };
        for (id, dest) in &self.subscriptions {
            if dest == destination {
                let frame = StompFrame::new(Command::Message)
                    .header("subscription", id.as_str())
                    .header("destination", destination)
                    .header("message-id", format!("m-{}", self.next_message_id))
                    .with_body(body);
                let _ = client.try_send(LinkEvent::Frame(frame));
            }
        }
    }

    fn reply(&self, frame: StompFrame) {
        if let Some(client) = &self.client {
            let _ = client.try_send(LinkEvent::Frame(frame));
        }
    }
}

/// STOMP broker behind a `MemoryConnector`. Accepts one bearer token,
/// acknowledges subscriptions with receipts and echoes every SEND to the
/// matching topic.
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub fn start(server: MemoryServer) -> Self {
        let state = Arc::new(Mutex::new(BrokerState {
            next_message_id: 1000,
            ..BrokerState::default()
        }));
        let task = tokio::spawn(serve(server, state.clone()));
        Self { state, task }
    }

    /// Connections accepted so far, rejected ones included
    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Whether the live connection holds a subscription to `destination`
    pub fn subscribed(&self, destination: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .any(|d| d == destination)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.lock().unwrap().unsubscribes.len()
    }

    pub fn published(&self) -> Vec<StompFrame> {
        self.state.lock().unwrap().published.clone()
    }

    /// Push a message to every subscriber of a conversation
    pub fn push(&self, conversation_id: i64, message: &Message) {
        let body = serde_json::to_string(message).unwrap();
        self.state
            .lock()
            .unwrap()
            .deliver(&format!("/topic/chat/{}", conversation_id), &body);
    }

    /// Push an arbitrary body, valid or not
    pub fn push_raw(&self, conversation_id: i64, body: &str) {
        self.state
            .lock()
            .unwrap()
            .deliver(&format!("/topic/chat/{}", conversation_id), body);
    }

    /// Drop the live connection from the server side
    pub fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();
        state.client = None;
        state.subscriptions.clear();
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut server: MemoryServer, state: Arc<Mutex<BrokerState>>) {
    while let Some(end) = server.accept().await {
        handle_connection(end, &state).await;
    }
}

async fn handle_connection(end: ServerEnd, state: &Arc<Mutex<BrokerState>>) {
    let (credential, mut frames, events) = end.split();
    {
        let mut s = state.lock().unwrap();
        s.connections += 1;
        s.subscriptions.clear();
        s.client = Some(events);
    }

    while let Some(frame) = frames.recv().await {
        let mut s = state.lock().unwrap();
        match frame.command {
            Command::Connect => {
                let presented = frame.get("Authorization").unwrap_or("").to_string();
                if credential.token() == TOKEN && presented == format!("Bearer {}", TOKEN) {
                    s.reply(StompFrame::new(Command::Connected).header("version", "1.2"));
                } else {
                    s.reply(StompFrame::new(Command::Error).header("message", "invalid token"));
                    s.client = None;
                }
            }
            Command::Subscribe => {
                let id = frame.get("id").unwrap_or_default().to_string();
                let destination = frame.get("destination").unwrap_or_default().to_string();
                s.subscriptions.insert(id, destination);
                if let Some(receipt) = frame.get("receipt") {
                    s.reply(StompFrame::new(Command::Receipt).header("receipt-id", receipt));
                }
            }
            Command::Unsubscribe => {
                let id = frame.get("id").unwrap_or_default().to_string();
                s.subscriptions.remove(&id);
                s.unsubscribes.push(id);
            }
            Command::Send => {
                s.published.push(frame.clone());
                let destination = frame.get("destination").unwrap_or_default();
                let Some(conversation) = destination.strip_prefix("/app/chat/") else {
                    continue;
                };
                let outbound: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
                s.next_message_id += 1;
                let echo = serde_json::json!({
                    "messageId": s.next_message_id,
                    "content": outbound["content"],
                    "writtenBy": outbound["writtenBy"],
                    "timestamp": 1_700_000_000_000i64,
                });
                s.deliver(&format!("/topic/chat/{}", conversation), &echo.to_string());
            }
            Command::Disconnect => {
                s.client = None;
                s.subscriptions.clear();
                break;
            }
            _ => {}
        }
    }
}

/// A session wired to a fresh broker
pub struct Harness {
    pub connector: Arc<MemoryConnector>,
    pub broker: FakeBroker,
    pub session: TransportSession,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let (connector, server) = MemoryConnector::pair();
        let connector = Arc::new(connector);
        let broker = FakeBroker::start(server);
        let session = TransportSession::new(config, connector.clone());
        Self {
            connector,
            broker,
            session,
        }
    }

    pub async fn connected() -> Self {
        let harness = Self::new();
        harness
            .session
            .connect(Credential::bearer(TOKEN))
            .await
            .unwrap();
        harness
    }
}

/// REST backend with per-conversation histories, failure switches and
/// gates that hold a history response until released
#[derive(Default)]
pub struct FakeApi {
    histories: Mutex<HashMap<i64, Vec<Message>>>,
    gates: Mutex<HashMap<i64, oneshot::Receiver<()>>>,
    failing: Mutex<HashSet<i64>>,
    conversations: Mutex<Vec<ConversationSummary>>,
    read: Mutex<Vec<i64>>,
    fetches: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_history(&self, conversation_id: i64, messages: Vec<Message>) {
        self.histories
            .lock()
            .unwrap()
            .insert(conversation_id, messages);
    }

    /// The next fetch of `conversation_id` waits until the sender fires
    pub fn gate(&self, conversation_id: i64) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(conversation_id, rx);
        tx
    }

    pub fn fail(&self, conversation_id: i64) {
        self.failing.lock().unwrap().insert(conversation_id);
    }

    pub fn heal(&self, conversation_id: i64) {
        self.failing.lock().unwrap().remove(&conversation_id);
    }

    pub fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn read_notifications(&self) -> Vec<i64> {
        self.read.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_history(&self, conversation_id: i64) -> Result<Vec<Message>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().remove(&conversation_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failing.lock().unwrap().contains(&conversation_id) {
            return Err(ChatError::HistoryFetchFailed(format!(
                "HTTP 500 for conversation {}",
                conversation_id
            )));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn mark_notification_read(&self, notification_id: i64) -> Result<()> {
        self.read.lock().unwrap().push(notification_id);
        Ok(())
    }
}
