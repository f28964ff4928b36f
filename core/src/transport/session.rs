/// Transport session: owns the single streaming connection, its reconnect
/// loop and the subscription registry.
///
/// All socket IO happens on one driver task. Callers talk to it through an
/// unbounded request queue and observe it through a `watch` channel, so no
/// caller ever holds the link.
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::transport::frame::{Command as FrameCommand, StompFrame};
use crate::transport::{Connector, Credential, FailureReason, Link, LinkEvent, SessionState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

type Ack = oneshot::Sender<Result<()>>;

/// Requests served by the driver task
enum Request {
    Subscribe { registration: Registration, ack: Ack },
    Unsubscribe { id: String },
    Publish { destination: String, body: String, ack: Ack },
    Disconnect,
}

struct Registration {
    id: String,
    destination: String,
    deliveries: mpsc::UnboundedSender<String>,
}

struct Driver {
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

struct SessionInner {
    config: Config,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<SessionState>>,
    driver: Mutex<Option<Driver>>,
    next_subscription: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.task.abort();
        }
    }
}

/// Handle to the process-wide streaming session. Cheap to clone.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<SessionInner>,
}

impl TransportSession {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                state: Arc::new(state),
                driver: Mutex::new(None),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Start the connection.
    ///
    /// Joins an attempt already in flight instead of opening a second
    /// connection. Returns the outcome of the first attempt; on a network
    /// failure the session keeps retrying in the background.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        let first_attempt = {
            let mut driver = self.inner.driver.lock().await;
            match self.state() {
                SessionState::Connected if driver.is_some() => return Ok(()),
                SessionState::Connecting if driver.is_some() => None,
                _ => {
                    if let Some(old) = driver.take() {
                        old.task.abort();
                    }
                    let (requests, rx) = mpsc::unbounded_channel();
                    let (first_tx, first_rx) = oneshot::channel();
                    let ctx = DriverContext {
                        config: self.inner.config.clone(),
                        connector: self.inner.connector.clone(),
                        state: self.inner.state.clone(),
                    };
                    ctx.set_state(SessionState::Connecting);
                    let task = tokio::spawn(run_driver(ctx, credential, rx, first_tx));
                    *driver = Some(Driver { requests, task });
                    Some(first_rx)
                }
            }
        };

        match first_attempt {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ChatError::Network("session driver stopped".to_string()))),
            None => self.wait_connected(self.inner.config.connect_timeout).await,
        }
    }

    /// Wait until the session leaves `Connecting`
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let settled = match timeout(limit, rx.wait_for(|s| *s != SessionState::Connecting)).await {
            Err(_) => return Err(ChatError::Timeout("connection not established".to_string())),
            Ok(Err(_)) => return Err(ChatError::NotConnected),
            Ok(Ok(state)) => state.clone(),
        };

        match settled {
            SessionState::Connected => Ok(()),
            SessionState::Failed(FailureReason::AuthRejected(reason)) => {
                Err(ChatError::AuthRejected(reason))
            }
            SessionState::Failed(reason) => Err(ChatError::Network(reason.to_string())),
            SessionState::Disconnected | SessionState::Connecting => Err(ChatError::NotConnected),
        }
    }

    /// Subscribe to a conversation's push topic.
    ///
    /// Raw frame bodies are delivered to `deliveries` in arrival order. While
    /// the session is `Connecting` the request is queued and sent on connect;
    /// the call waits at most `subscribe_wait` for the server receipt. With no
    /// session at all it fails immediately with `NotConnected`.
    pub async fn subscribe(
        &self,
        conversation_id: i64,
        deliveries: mpsc::UnboundedSender<String>,
    ) -> Result<SubscriptionHandle> {
        match self.state() {
            SessionState::Connected | SessionState::Connecting => {}
            _ => return Err(ChatError::NotConnected),
        }
        let requests = self.requests().await.ok_or(ChatError::NotConnected)?;

        let id = format!(
            "sub-{}",
            self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let destination = self.inner.config.subscribe_destination(conversation_id);
        let (ack, acked) = oneshot::channel();

        requests
            .send(Request::Subscribe {
                registration: Registration {
                    id: id.clone(),
                    destination: destination.clone(),
                    deliveries,
                },
                ack,
            })
            .map_err(|_| ChatError::NotConnected)?;

        // Dropping the handle on any error path withdraws the registration
        let handle = SubscriptionHandle {
            id,
            conversation_id,
            destination,
            requests,
            released: AtomicBool::new(false),
        };

        match timeout(self.inner.config.subscribe_wait, acked).await {
            Ok(Ok(Ok(()))) => {
                debug!("Subscribed {} to {}", handle.id, handle.destination);
                Ok(handle)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ChatError::NotConnected),
            Err(_) => {
                warn!(
                    "Subscription to {} not acknowledged within {:?}",
                    handle.destination, self.inner.config.subscribe_wait
                );
                if self.state() == SessionState::Connected {
                    Err(ChatError::Timeout("subscribe receipt".to_string()))
                } else {
                    Err(ChatError::NotConnected)
                }
            }
        }
    }

    /// Release a subscription. Safe to call any number of times.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.release();
    }

    /// Publish a JSON payload to a conversation. Fails fast when there is
    /// no live connection.
    pub async fn publish(&self, conversation_id: i64, payload: String) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(ChatError::NotConnected);
        }
        let requests = self.requests().await.ok_or(ChatError::NotConnected)?;
        let (ack, acked) = oneshot::channel();
        requests
            .send(Request::Publish {
                destination: self.inner.config.publish_destination(conversation_id),
                body: payload,
                ack,
            })
            .map_err(|_| ChatError::NotConnected)?;
        acked.await.unwrap_or(Err(ChatError::NotConnected))
    }

    /// Tear down the connection and every subscription
    pub async fn disconnect(&self) {
        let driver = self.inner.driver.lock().await.take();
        if let Some(driver) = driver {
            let _ = driver.requests.send(Request::Disconnect);
            if let Err(e) = driver.task.await {
                if !e.is_cancelled() {
                    error!("Session driver panicked: {}", e);
                }
            }
        }
        self.inner.state.send_replace(SessionState::Disconnected);
        info!("Session disconnected");
    }

    async fn requests(&self) -> Option<mpsc::UnboundedSender<Request>> {
        self.inner
            .driver
            .lock()
            .await
            .as_ref()
            .map(|d| d.requests.clone())
    }
}

/// One registered subscription. Released on `release()` or drop.
pub struct SubscriptionHandle {
    id: String,
    conversation_id: i64,
    destination: String,
    requests: mpsc::UnboundedSender<Request>,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns `false` if the handle was already released
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!("Releasing {}", self.id);
        // The driver may already be gone; nothing left to release then
        let _ = self.requests.send(Request::Unsubscribe {
            id: self.id.clone(),
        });
        true
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("released", &self.is_released())
            .finish()
    }
}

enum Flow {
    Proceed,
    Stop,
}

struct DriverContext {
    config: Config,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<SessionState>>,
}

impl DriverContext {
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Session state {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    /// Open a link and complete the STOMP handshake
    async fn establish(
        &self,
        credential: &Credential,
    ) -> Result<(Box<dyn Link>, mpsc::Receiver<LinkEvent>)> {
        let host = self.connector.host();
        debug!("Connecting to {}", host);

        let (link, mut events) = timeout(self.config.connect_timeout, self.connector.connect(credential))
            .await
            .map_err(|_| ChatError::Network("connect timed out".to_string()))??;

        link.send(StompFrame::connect(&host, credential.token())).await?;

        let reply = timeout(self.config.connect_timeout, next_frame(&mut events))
            .await
            .map_err(|_| ChatError::Network("no CONNECTED frame before timeout".to_string()))?;

        match reply {
            Some(frame) if frame.command == FrameCommand::Connected => {
                debug!(
                    "STOMP session established (version {})",
                    frame.get("version").unwrap_or("unknown")
                );
                Ok((link, events))
            }
            Some(frame) if frame.command == FrameCommand::Error => {
                let reason = frame.get("message").unwrap_or("rejected").to_string();
                link.close().await;
                Err(ChatError::AuthRejected(reason))
            }
            Some(frame) => {
                link.close().await;
                Err(ChatError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    frame.command
                )))
            }
            None => Err(ChatError::Network(
                "connection closed during handshake".to_string(),
            )),
        }
    }
}

async fn next_frame(events: &mut mpsc::Receiver<LinkEvent>) -> Option<StompFrame> {
    match events.recv().await? {
        LinkEvent::Frame(frame) => Some(frame),
        LinkEvent::Closed(reason) => {
            debug!("Link closed during handshake: {:?}", reason);
            None
        }
    }
}

/// Subscriptions and pending acknowledgements, owned by the driver task
#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, Registration>,
    /// Subscribe acks to resolve after the next successful connect
    waiting: Vec<(String, Ack)>,
    /// Subscribe acks awaiting a RECEIPT, keyed by receipt id
    receipts: HashMap<String, (String, Ack)>,
}

impl Registry {
    fn handle_offline(&mut self, request: Request) -> Flow {
        match request {
            Request::Subscribe { registration, ack } => {
                debug!("Queueing {} until connected", registration.destination);
                self.waiting.push((registration.id.clone(), ack));
                self.subscriptions
                    .insert(registration.id.clone(), registration);
            }
            Request::Unsubscribe { id } => self.forget(&id),
            Request::Publish { ack, .. } => {
                let _ = ack.send(Err(ChatError::NotConnected));
            }
            Request::Disconnect => {
                self.subscriptions.clear();
                return Flow::Stop;
            }
        }
        Flow::Proceed
    }

    async fn handle_online(&mut self, request: Request, link: &dyn Link) -> Result<Flow> {
        match request {
            Request::Subscribe { registration, ack } => {
                let receipt = Uuid::new_v4().to_string();
                let frame =
                    StompFrame::subscribe(&registration.id, &registration.destination, Some(&receipt));
                self.receipts
                    .insert(receipt, (registration.id.clone(), ack));
                self.subscriptions
                    .insert(registration.id.clone(), registration);
                link.send(frame).await?;
            }
            Request::Unsubscribe { id } => {
                let known = self.subscriptions.contains_key(&id);
                self.forget(&id);
                if known {
                    link.send(StompFrame::unsubscribe(&id)).await?;
                }
            }
            Request::Publish {
                destination,
                body,
                ack,
            } => {
                if let Err(e) = link.send(StompFrame::send(&destination, body)).await {
                    let reason = e.to_string();
                    let _ = ack.send(Err(ChatError::Network(reason.clone())));
                    return Err(ChatError::Network(reason));
                }
                let _ = ack.send(Ok(()));
            }
            Request::Disconnect => {
                let _ = link.send(StompFrame::new(FrameCommand::Disconnect)).await;
                self.subscriptions.clear();
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Proceed)
    }

    fn forget(&mut self, id: &str) {
        self.subscriptions.remove(id);
        self.waiting.retain(|(waiting_id, _)| waiting_id != id);
        self.receipts.retain(|_, (waiting_id, _)| waiting_id != id);
    }

    /// Send SUBSCRIBE for every registration on a fresh link. Queued
    /// requests get a receipt so their callers learn when they are live.
    async fn resubscribe(&mut self, link: &dyn Link) -> Result<()> {
        for (id, ack) in self.waiting.drain(..) {
            self.receipts.insert(Uuid::new_v4().to_string(), (id, ack));
        }
        let receipt_for: HashMap<&str, &str> = self
            .receipts
            .iter()
            .map(|(receipt, (id, _))| (id.as_str(), receipt.as_str()))
            .collect();

        for registration in self.subscriptions.values() {
            let receipt = receipt_for.get(registration.id.as_str()).copied();
            link.send(StompFrame::subscribe(
                &registration.id,
                &registration.destination,
                receipt,
            ))
            .await?;
        }
        if !self.subscriptions.is_empty() {
            info!("Subscribed {} conversation topic(s)", self.subscriptions.len());
        }
        Ok(())
    }

    /// Route one inbound frame. Returns `false` when the connection must be
    /// dropped.
    async fn dispatch(&mut self, frame: StompFrame, link: &dyn Link) -> bool {
        match frame.command {
            FrameCommand::Message => {
                let Some(id) = frame.get("subscription").map(str::to_string) else {
                    warn!("Dropping MESSAGE without subscription header");
                    return true;
                };
                let Some(registration) = self.subscriptions.get(&id) else {
                    trace!("MESSAGE for released subscription {}", id);
                    return true;
                };
                if registration.deliveries.send(frame.body).is_err() {
                    debug!("Subscriber for {} went away, unsubscribing", id);
                    self.forget(&id);
                    if link.send(StompFrame::unsubscribe(&id)).await.is_err() {
                        return false;
                    }
                }
            }
            FrameCommand::Receipt => {
                if let Some((id, ack)) = frame
                    .get("receipt-id")
                    .and_then(|receipt| self.receipts.remove(receipt))
                {
                    trace!("Subscription {} acknowledged", id);
                    let _ = ack.send(Ok(()));
                }
            }
            FrameCommand::Error => {
                warn!(
                    "Server error frame: {}",
                    frame.get("message").unwrap_or("no message")
                );
                return false;
            }
            other => debug!("Ignoring {} frame", other),
        }
        true
    }

    /// Serve a live link until it drops (`Proceed`) or the session is
    /// torn down (`Stop`).
    async fn serve(
        &mut self,
        link: &dyn Link,
        events: &mut mpsc::Receiver<LinkEvent>,
        requests: &mut mpsc::UnboundedReceiver<Request>,
    ) -> Flow {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(LinkEvent::Frame(frame)) => {
                        if !self.dispatch(frame, link).await {
                            return Flow::Proceed;
                        }
                    }
                    Some(LinkEvent::Closed(reason)) => {
                        info!("Server closed the connection: {}", reason.as_deref().unwrap_or("no reason"));
                        return Flow::Proceed;
                    }
                    None => return Flow::Proceed,
                },
                request = requests.recv() => {
                    let Some(request) = request else {
                        let _ = link.send(StompFrame::new(FrameCommand::Disconnect)).await;
                        return Flow::Stop;
                    };
                    match self.handle_online(request, link).await {
                        Ok(Flow::Stop) => return Flow::Stop,
                        Ok(Flow::Proceed) => {}
                        Err(e) => {
                            warn!("Write failed: {}", e);
                            return Flow::Proceed;
                        }
                    }
                }
            }
        }
    }

    /// In-flight receipts will never arrive on a dead link
    fn connection_lost(&mut self) {
        for (_, pending) in self.receipts.drain() {
            self.waiting.push(pending);
        }
    }

    fn fail_all(&mut self, err: impl Fn() -> ChatError) {
        for (_, ack) in self.waiting.drain(..) {
            let _ = ack.send(Err(err()));
        }
        for (_, (_, ack)) in self.receipts.drain() {
            let _ = ack.send(Err(err()));
        }
        self.subscriptions.clear();
    }
}

/// Drive `until` while answering requests offline. `None` means the session
/// was torn down before `until` finished.
async fn idle_until<F>(
    until: F,
    registry: &mut Registry,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) -> Option<F::Output>
where
    F: std::future::Future,
{
    tokio::pin!(until);
    loop {
        tokio::select! {
            output = &mut until => return Some(output),
            request = requests.recv() => match request {
                Some(request) => {
                    if let Flow::Stop = registry.handle_offline(request) {
                        return None;
                    }
                }
                None => return None,
            },
        }
    }
}

async fn run_driver(
    ctx: DriverContext,
    credential: Credential,
    mut requests: mpsc::UnboundedReceiver<Request>,
    first: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first);
    let mut registry = Registry::default();
    let mut failures: u32 = 0;

    loop {
        ctx.set_state(SessionState::Connecting);

        let Some(attempt) = idle_until(ctx.establish(&credential), &mut registry, &mut requests).await
        else {
            break;
        };

        match attempt {
            Ok((link, mut events)) => {
                failures = 0;
                match registry.resubscribe(link.as_ref()).await {
                    Ok(()) => {
                        ctx.set_state(SessionState::Connected);
                        info!("Connected");
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Ok(()));
                        }
                        if let Flow::Stop = registry.serve(link.as_ref(), &mut events, &mut requests).await {
                            link.close().await;
                            break;
                        }
                    }
                    Err(e) => warn!("Resubscribe failed: {}", e),
                }
                link.close().await;
                registry.connection_lost();
                ctx.set_state(SessionState::Connecting);
                warn!(
                    "Connection lost, reconnecting in {:?}",
                    ctx.config.reconnect_delay
                );
            }
            Err(ChatError::AuthRejected(reason)) => {
                error!("Credential rejected: {}", reason);
                registry.fail_all(|| ChatError::AuthRejected(reason.clone()));
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(ChatError::AuthRejected(reason.clone())));
                }
                ctx.set_state(SessionState::Failed(FailureReason::AuthRejected(reason)));
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Connection attempt {} failed: {}; retrying in {:?}",
                    failures, e, ctx.config.reconnect_delay
                );
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(e));
                }
                if let Some(max) = ctx.config.max_reconnect_attempts {
                    if failures >= max {
                        error!("Giving up after {} failed attempts", failures);
                        registry.fail_all(|| ChatError::NotConnected);
                        ctx.set_state(SessionState::Failed(FailureReason::RetriesExhausted(
                            failures,
                        )));
                        return;
                    }
                }
            }
        }

        // Fixed delay between attempts
        if idle_until(sleep(ctx.config.reconnect_delay), &mut registry, &mut requests)
            .await
            .is_none()
        {
            break;
        }
    }

    registry.fail_all(|| ChatError::NotConnected);
    ctx.set_state(SessionState::Disconnected);
    if let Some(tx) = first.take() {
        let _ = tx.send(Err(ChatError::NotConnected));
    }
}
