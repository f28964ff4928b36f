/// SwipeChat - real-time conversation engine
///
/// Authenticated, reconnecting STOMP session with per-conversation channels,
/// a deduplicating message timeline and a switchboard that keeps
/// conversation switches race-free.

pub mod error;
pub mod config;
pub mod types;
pub mod transport;
pub mod timeline;
pub mod api;
pub mod channel;
pub mod switchboard;
pub mod cli_app;

pub use api::{ChatApi, HttpChatApi};
pub use channel::{ConversationChannel, Delivery};
pub use config::Config;
pub use error::{ChatError, Result};
pub use switchboard::{OpenOutcome, SwitchState, Switchboard};
pub use timeline::MessageTimeline;
pub use transport::{Credential, SessionState, SubscriptionHandle, TransportSession};
pub use types::{ChatEvent, ConversationSummary, Message};
