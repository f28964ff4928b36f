/// Conversation channel: one conversation's push subscription plus its
/// outbound send path.
///
/// Inbound frames are decoded on a small pump task and forwarded as
/// `Delivery` values to a queue owned by whoever opened the channel. Nothing
/// is forwarded once `close()` has run.
use crate::error::{ChatError, Result};
use crate::transport::{SubscriptionHandle, TransportSession};
use crate::types::{Message, OutboundMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sink slot shared by the channel and its pump. `close()` empties it, so
/// no send can start after `close()` returns.
type SinkSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Delivery>>>>;

/// A decoded push, tagged with the open request that created its channel
#[derive(Debug, Clone)]
pub struct Delivery {
    pub generation: u64,
    pub conversation_id: i64,
    pub message: Message,
}

/// Shared handle; the subscription is released on `close()` or when the
/// last clone is dropped.
#[derive(Clone)]
pub struct ConversationChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    conversation_id: i64,
    generation: u64,
    session: TransportSession,
    handle: SubscriptionHandle,
    closed: AtomicBool,
    sink: SinkSlot,
    pump: JoinHandle<()>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        take_sink(&self.sink);
        self.pump.abort();
    }
}

impl ConversationChannel {
    /// Subscribe to `conversation_id`. Every decoded push is sent to `sink`
    /// exactly once, in transport order, tagged with `generation`.
    pub async fn open(
        session: &TransportSession,
        conversation_id: i64,
        generation: u64,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<Self> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let handle = session.subscribe(conversation_id, frames_tx).await?;

        let sink: SinkSlot = Arc::new(Mutex::new(Some(sink)));
        let pump = tokio::spawn(pump(conversation_id, generation, frames_rx, sink.clone()));
        debug!(
            "Opened channel for conversation {} (generation {})",
            conversation_id, generation
        );

        Ok(Self {
            inner: Arc::new(ChannelInner {
                conversation_id,
                generation,
                session: session.clone(),
                handle,
                closed: AtomicBool::new(false),
                sink,
                pump,
            }),
        })
    }

    pub fn conversation_id(&self) -> i64 {
        self.inner.conversation_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn subscription_id(&self) -> &str {
        self.inner.handle.id()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Publish a message. There is no optimistic insert: the server echo on
    /// this channel is what reaches the timeline.
    pub async fn send(&self, content: &str, sender_id: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::ChannelClosed(self.inner.conversation_id));
        }
        let payload = serde_json::to_string(&OutboundMessage {
            content: content.to_string(),
            written_by: sender_id.to_string(),
            match_id: self.inner.conversation_id,
        })?;
        self.inner
            .session
            .publish(self.inner.conversation_id, payload)
            .await
    }

    /// Unsubscribe and stop forwarding. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        take_sink(&self.inner.sink);
        self.inner.session.unsubscribe(&self.inner.handle);
        self.inner.pump.abort();
        debug!(
            "Closed channel for conversation {} (generation {})",
            self.inner.conversation_id, self.inner.generation
        );
        true
    }
}

impl std::fmt::Debug for ConversationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationChannel")
            .field("conversation_id", &self.inner.conversation_id)
            .field("generation", &self.inner.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn take_sink(sink: &SinkSlot) {
    match sink.lock() {
        Ok(mut slot) => {
            slot.take();
        }
        Err(poisoned) => {
            poisoned.into_inner().take();
        }
    }
}

async fn pump(
    conversation_id: i64,
    generation: u64,
    mut frames: mpsc::UnboundedReceiver<String>,
    sink: SinkSlot,
) {
    while let Some(body) = frames.recv().await {
        let message = match serde_json::from_str::<Message>(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping malformed push on conversation {}: {}",
                    conversation_id, e
                );
                continue;
            }
        };
        let delivery = Delivery {
            generation,
            conversation_id,
            message,
        };
        // Send under the lock so close() cannot interleave
        let forwarded = match sink.lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|sink| sink.send(delivery).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        };
        if !forwarded {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(id: i64) -> String {
        format!(
            r#"{{"messageId":{},"content":"hi","writtenBy":"2","timestamp":1700000000000}}"#,
            id
        )
    }

    #[tokio::test]
    async fn test_pump_stops_once_sink_taken() {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sink, mut deliveries) = mpsc::unbounded_channel();
        let slot: SinkSlot = Arc::new(Mutex::new(Some(sink)));

        frames_tx.send(body(1)).unwrap();
        frames_tx.send("garbage".to_string()).unwrap();
        frames_tx.send(body(2)).unwrap();
        let task = tokio::spawn(pump(7, 3, frames_rx, slot.clone()));

        assert_eq!(deliveries.recv().await.unwrap().message.message_id, 1);
        let second = deliveries.recv().await.unwrap();
        assert_eq!(second.message.message_id, 2);
        assert_eq!(second.generation, 3);

        take_sink(&slot);
        frames_tx.send(body(3)).unwrap();
        task.await.unwrap();

        // 3 was never forwarded and the sink is gone
        assert!(deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_forwards_nothing_after_close() {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sink, mut deliveries) = mpsc::unbounded_channel();
        let slot: SinkSlot = Arc::new(Mutex::new(Some(sink)));
        take_sink(&slot);

        for id in 1..=3 {
            frames_tx.send(body(id)).unwrap();
        }
        pump(7, 1, frames_rx, slot).await;

        assert!(deliveries.recv().await.is_none());
    }
}
