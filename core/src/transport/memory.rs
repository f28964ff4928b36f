/// In-process connector. The server end of every link is handed to the
/// owner of the paired `MemoryServer`, which makes the session drivable
/// without sockets.
use crate::error::{ChatError, Result};
use crate::transport::{Connector, Credential, Link, LinkEvent, StompFrame};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 256;

pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<ServerEnd>,
    refusals: AtomicU32,
}

impl MemoryConnector {
    /// Create a connector and the server that accepts its links
    pub fn pair() -> (Self, MemoryServer) {
        let (incoming, accepted) = mpsc::unbounded_channel();
        (
            Self {
                incoming,
                refusals: AtomicU32::new(0),
            },
            MemoryServer { accepted },
        )
    }

    /// Fail the next `n` connection attempts with a network error
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<(Box<dyn Link>, mpsc::Receiver<LinkEvent>)> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChatError::Network("connection refused".to_string()));
        }

        let (to_server, frames) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::channel(EVENT_BUFFER);
        self.incoming
            .send(ServerEnd {
                credential: credential.clone(),
                frames,
                events,
            })
            .map_err(|_| ChatError::Network("memory server is gone".to_string()))?;

        Ok((Box::new(MemoryLink { to_server }), event_rx))
    }

    fn host(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryLink {
    to_server: mpsc::UnboundedSender<StompFrame>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: StompFrame) -> Result<()> {
        self.to_server
            .send(frame)
            .map_err(|_| ChatError::Network("server end closed".to_string()))
    }

    async fn close(&self) {}
}

/// Accepts links opened through the paired connector
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepted.recv().await
    }
}

/// Server side of one link. Dropping it (or its event sender) closes the
/// link from the client's point of view.
pub struct ServerEnd {
    credential: Credential,
    frames: mpsc::UnboundedReceiver<StompFrame>,
    events: mpsc::Sender<LinkEvent>,
}

impl ServerEnd {
    /// Credential presented by the client
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Next frame written by the client
    pub async fn recv(&mut self) -> Option<StompFrame> {
        self.frames.recv().await
    }

    /// Deliver a frame to the client
    pub async fn send(&self, frame: StompFrame) -> Result<()> {
        self.events
            .send(LinkEvent::Frame(frame))
            .await
            .map_err(|_| ChatError::Network("client end closed".to_string()))
    }

    /// Split into the inbound frame queue and the outbound event sender
    pub fn split(
        self,
    ) -> (
        Credential,
        mpsc::UnboundedReceiver<StompFrame>,
        mpsc::Sender<LinkEvent>,
    ) {
        (self.credential, self.frames, self.events)
    }
}
