/// Error types for the conversation engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Credential rejected: {0}")]
    AuthRejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not connected")]
    NotConnected,

    #[error("History fetch failed: {0}")]
    HistoryFetchFailed(String),

    #[error("Channel for conversation {0} is closed")]
    ChannelClosed(i64),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether the session may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Network(_) | ChatError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
