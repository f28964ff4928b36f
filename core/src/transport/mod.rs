/// Streaming transport: one authenticated connection multiplexing many
/// conversation subscriptions.
pub mod frame;
pub mod memory;
pub mod session;
pub mod websocket;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

pub use frame::{Command, StompFrame};
pub use session::{SubscriptionHandle, TransportSession};

/// Bearer credential attached to the connection handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Why a session stopped for good
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    AuthRejected(String),
    RetriesExhausted(u32),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AuthRejected(reason) => write!(f, "credential rejected: {}", reason),
            FailureReason::RetriesExhausted(n) => write!(f, "gave up after {} attempts", n),
        }
    }
}

/// Connection state of the transport session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    /// No connection and no attempt in progress
    Disconnected,
    /// Establishing, or waiting out the reconnect delay
    Connecting,
    /// Handshake complete, subscriptions live
    Connected,
    /// Terminal; a new `connect` is required
    Failed(FailureReason),
}

/// Events produced by a live link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A decoded frame from the server
    Frame(StompFrame),
    /// The link closed; carries the close reason when known
    Closed(Option<String>),
}

/// Outbound half of an established connection.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, frame: StompFrame) -> Result<()>;

    async fn close(&self);
}

/// Opens links. Implementations map credential refusal during the
/// transport-level handshake to `ChatError::AuthRejected` and everything
/// else to `ChatError::Network`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<(Box<dyn Link>, mpsc::Receiver<LinkEvent>)>;

    /// Value of the STOMP `host` header
    fn host(&self) -> String {
        "localhost".to_string()
    }
}
