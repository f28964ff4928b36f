/// Conversation switchboard: which conversation is active, and the rules
/// that keep a superseded open from touching the timeline.
///
/// Every open takes a fresh generation number. The history fetch and the
/// channel subscribe run concurrently; when both finish the result is only
/// applied if the generation is still current. Pushes travel through one
/// delivery queue drained by a dispatcher task, which drops anything tagged
/// with an old generation and buffers current pushes until the history seed
/// has landed.
use crate::api::ChatApi;
use crate::channel::{ConversationChannel, Delivery};
use crate::error::{ChatError, Result};
use crate::timeline::MessageTimeline;
use crate::transport::TransportSession;
use crate::types::{ChatEvent, ConversationSummary, Message};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of the active conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SwitchState {
    Idle,
    Opening { conversation_id: i64 },
    Switching { from: i64, to: i64 },
    Active { conversation_id: i64 },
}

impl SwitchState {
    /// Conversation the switchboard is on or heading to
    pub fn target(&self) -> Option<i64> {
        match self {
            SwitchState::Idle => None,
            SwitchState::Opening { conversation_id } | SwitchState::Active { conversation_id } => {
                Some(*conversation_id)
            }
            SwitchState::Switching { to, .. } => Some(*to),
        }
    }
}

/// Result of `open_conversation`
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Active {
        conversation_id: i64,
        summary: Option<ConversationSummary>,
        messages: Vec<Message>,
    },
    /// A later open or a close took over before this one finished
    Superseded,
}

struct Board {
    generation: u64,
    state: SwitchState,
    timeline: MessageTimeline,
    live: Option<ConversationChannel>,
    seeded: bool,
    pending: Vec<Message>,
    directory: HashMap<i64, ConversationSummary>,
}

impl Board {
    fn new() -> Self {
        Self {
            generation: 0,
            state: SwitchState::Idle,
            timeline: MessageTimeline::new(),
            live: None,
            seeded: false,
            pending: Vec::new(),
            directory: HashMap::new(),
        }
    }

    /// Start a new generation: clear the timeline and detach the live channel
    fn advance(&mut self, next: SwitchState) -> (u64, Option<ConversationChannel>) {
        self.generation += 1;
        self.state = next;
        self.timeline.clear();
        self.seeded = false;
        self.pending.clear();
        (self.generation, self.live.take())
    }
}

struct Shared {
    board: Mutex<Board>,
    events: broadcast::Sender<ChatEvent>,
}

impl Shared {
    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_state(&self, state: &SwitchState) {
        self.emit(ChatEvent::Conversation {
            state: state.clone(),
        });
    }
}

pub struct Switchboard {
    session: TransportSession,
    api: Arc<dyn ChatApi>,
    sender_id: String,
    shared: Arc<Shared>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    tasks: Vec<JoinHandle<()>>,
}

impl Switchboard {
    /// `sender_id` is written as the author of every outbound message
    pub fn new(
        session: TransportSession,
        api: Arc<dyn ChatApi>,
        sender_id: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            board: Mutex::new(Board::new()),
            events,
        });
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(dispatch(shared.clone(), delivery_rx)),
            tokio::spawn(forward_session_state(shared.clone(), session.clone())),
        ];

        Self {
            session,
            api,
            sender_id: sender_id.into(),
            shared,
            deliveries,
            tasks,
        }
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// Resolves with `Superseded` when another open or a close happened
    /// while this one was waiting. On failure the switchboard stays in
    /// `Opening` without a live channel; retrying means calling this again.
    pub async fn open_conversation(&self, conversation_id: i64) -> Result<OpenOutcome> {
        let (generation, previous) = {
            let mut board = self.shared.board.lock().await;
            if board.state == (SwitchState::Active { conversation_id }) {
                debug!("Conversation {} already active", conversation_id);
                return Ok(OpenOutcome::Active {
                    conversation_id,
                    summary: board.directory.get(&conversation_id).cloned(),
                    messages: board.timeline.snapshot(),
                });
            }
            let next = match board.state {
                SwitchState::Active { conversation_id: from } => SwitchState::Switching {
                    from,
                    to: conversation_id,
                },
                _ => SwitchState::Opening { conversation_id },
            };
            let advanced = board.advance(next);
            self.shared.emit_state(&board.state);
            advanced
        };

        if let Some(channel) = previous {
            channel.close();
        }
        info!(
            "Opening conversation {} (generation {})",
            conversation_id, generation
        );

        let (history, channel) = tokio::join!(
            self.api.fetch_history(conversation_id),
            ConversationChannel::open(
                &self.session,
                conversation_id,
                generation,
                self.deliveries.clone()
            ),
        );

        let mut board = self.shared.board.lock().await;
        if board.generation != generation {
            if let Ok(channel) = channel {
                channel.close();
            }
            debug!(
                "Discarding stale open of conversation {} (generation {}, now {})",
                conversation_id, generation, board.generation
            );
            return Ok(OpenOutcome::Superseded);
        }

        let (history, channel) = match (history, channel) {
            (Ok(history), Ok(channel)) => (history, channel),
            (history, channel) => {
                if let Ok(channel) = &channel {
                    channel.close();
                }
                board.pending.clear();
                board.state = SwitchState::Opening { conversation_id };
                self.shared.emit_state(&board.state);

                let error = match (history, channel) {
                    (Err(ChatError::HistoryFetchFailed(reason)), _) => {
                        ChatError::HistoryFetchFailed(reason)
                    }
                    (Err(other), _) => ChatError::HistoryFetchFailed(other.to_string()),
                    (Ok(_), Err(e)) => e,
                    (Ok(_), Ok(_)) => ChatError::NotConnected,
                };
                warn!("Failed to open conversation {}: {}", conversation_id, error);
                return Err(error);
            }
        };

        board.timeline.seed(history);
        board.seeded = true;
        let buffered = std::mem::take(&mut board.pending);
        if !buffered.is_empty() {
            trace!("Applying {} buffered pushes", buffered.len());
        }
        for message in buffered {
            if board.timeline.append(message.clone()) {
                self.shared.emit(ChatEvent::MessageAppended {
                    conversation_id,
                    message,
                });
            }
        }

        board.live = Some(channel);
        board.state = SwitchState::Active { conversation_id };
        self.shared.emit_state(&board.state);
        info!(
            "Conversation {} active with {} messages",
            conversation_id,
            board.timeline.len()
        );

        Ok(OpenOutcome::Active {
            conversation_id,
            summary: board.directory.get(&conversation_id).cloned(),
            messages: board.timeline.snapshot(),
        })
    }

    /// Leave the active conversation and go back to `Idle`
    pub async fn close(&self) {
        let previous = {
            let mut board = self.shared.board.lock().await;
            let (_, previous) = board.advance(SwitchState::Idle);
            self.shared.emit_state(&board.state);
            previous
        };
        if let Some(channel) = previous {
            channel.close();
        }
        debug!("Switchboard idle");
    }

    /// Send through the active conversation's channel. The message shows up
    /// in the timeline once the server echoes it.
    pub async fn send(&self, content: &str) -> Result<()> {
        let channel = {
            let board = self.shared.board.lock().await;
            match (&board.state, &board.live) {
                (SwitchState::Active { .. }, Some(channel)) => channel.clone(),
                _ => return Err(ChatError::NoActiveConversation),
            }
        };
        channel.send(content, &self.sender_id).await
    }

    /// Ordered copy of the active timeline
    pub async fn snapshot(&self) -> Vec<Message> {
        self.shared.board.lock().await.timeline.snapshot()
    }

    pub async fn state(&self) -> SwitchState {
        self.shared.board.lock().await.state.clone()
    }

    pub async fn active_conversation(&self) -> Option<i64> {
        match self.shared.board.lock().await.state {
            SwitchState::Active { conversation_id } => Some(conversation_id),
            _ => None,
        }
    }

    /// Receiver for session, switchboard and timeline events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    /// Reload the conversation list and cache it by conversation id
    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conversations = self.api.list_conversations().await?;
        let mut board = self.shared.board.lock().await;
        board.directory = conversations
            .iter()
            .map(|c| (c.match_id, c.clone()))
            .collect();
        debug!("Directory holds {} conversations", board.directory.len());
        Ok(conversations)
    }

    /// Cached summary from the last `refresh_conversations`
    pub async fn conversation(&self, conversation_id: i64) -> Option<ConversationSummary> {
        self.shared
            .board
            .lock()
            .await
            .directory
            .get(&conversation_id)
            .cloned()
    }

    pub async fn mark_notification_read(&self, notification_id: i64) -> Result<()> {
        self.api.mark_notification_read(notification_id).await
    }
}

impl Drop for Switchboard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        let mut board = shared.board.lock().await;
        if delivery.generation != board.generation {
            trace!(
                "Dropping push {} from generation {} (current {})",
                delivery.message.message_id,
                delivery.generation,
                board.generation
            );
            continue;
        }
        if !board.seeded {
            board.pending.push(delivery.message);
            continue;
        }
        if board.timeline.append(delivery.message.clone()) {
            shared.emit(ChatEvent::MessageAppended {
                conversation_id: delivery.conversation_id,
                message: delivery.message,
            });
        } else {
            trace!("Duplicate push {} ignored", delivery.message.message_id);
        }
    }
}

async fn forward_session_state(shared: Arc<Shared>, session: TransportSession) {
    let mut states = session.watch_state();
    drop(session);
    loop {
        let state = states.borrow_and_update().clone();
        shared.emit(ChatEvent::Session { state });
        if states.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_state_target() {
        assert_eq!(SwitchState::Idle.target(), None);
        assert_eq!(
            SwitchState::Switching { from: 1, to: 2 }.target(),
            Some(2)
        );
        assert_eq!(
            SwitchState::Active { conversation_id: 7 }.target(),
            Some(7)
        );
    }

    #[test]
    fn test_switch_state_serializes_with_phase() {
        let json = serde_json::to_value(SwitchState::Switching { from: 1, to: 2 }).unwrap();
        assert_eq!(json["phase"], "switching");
        assert_eq!(json["to"], 2);
    }

    #[test]
    fn test_advance_clears_and_bumps_generation() {
        let mut board = Board::new();
        board.seeded = true;
        board.pending.push(Message {
            message_id: 1,
            content: "hi".to_string(),
            written_by: "1".to_string(),
            timestamp: 0,
        });

        let (generation, previous) = board.advance(SwitchState::Opening { conversation_id: 4 });

        assert_eq!(generation, 1);
        assert!(previous.is_none());
        assert!(!board.seeded);
        assert!(board.pending.is_empty());
        assert_eq!(board.state, SwitchState::Opening { conversation_id: 4 });
    }
}
