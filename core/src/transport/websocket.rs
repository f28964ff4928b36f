/// WebSocket connector: STOMP frames carried in text messages
use crate::error::{ChatError, Result};
use crate::transport::{Connector, Credential, Link, LinkEvent, StompFrame};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode, Uri};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, WsMessage>;
type WsStream = SplitStream<RawWs>;

const EVENT_BUFFER: usize = 256;

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<(Box<dyn Link>, mpsc::Receiver<LinkEvent>)> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::Config(format!("invalid WebSocket URL {}: {}", self.url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token())).map_err(|_| {
            ChatError::AuthRejected("credential is not a valid header value".to_string())
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        info!("Dialing {}", self.url);
        let (ws, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(response))
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                return Err(ChatError::AuthRejected(format!(
                    "upgrade refused with {}",
                    response.status()
                )));
            }
            Err(e) => return Err(ChatError::Network(format!("WebSocket connect failed: {}", e))),
        };

        let (sink, stream) = ws.split();
        let (events, event_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_pump(stream, events));

        Ok((
            Box::new(WebSocketLink {
                sink: Mutex::new(sink),
            }),
            event_rx,
        ))
    }

    fn host(&self) -> String {
        self.url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

struct WebSocketLink {
    sink: Mutex<WsSink>,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&self, frame: StompFrame) -> Result<()> {
        trace!("--> {}", frame);
        self.sink
            .lock()
            .await
            .send(WsMessage::text(frame.encode()))
            .await
            .map_err(|e| ChatError::Network(format!("WebSocket send error: {}", e)))
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("WebSocket close: {}", e);
        }
    }
}

/// Decode and forward one text payload. Returns `false` once the session
/// stopped listening.
async fn forward(text: &str, events: &mpsc::Sender<LinkEvent>) -> bool {
    match StompFrame::decode(text) {
        Ok(Some(frame)) => {
            trace!("<-- {}", frame);
            events.send(LinkEvent::Frame(frame)).await.is_ok()
        }
        Ok(None) => {
            trace!("<-- heart-beat");
            true
        }
        Err(e) => {
            warn!("Dropping malformed frame: {}", e);
            true
        }
    }
}

async fn read_pump(mut stream: WsStream, events: mpsc::Sender<LinkEvent>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if !forward(text.as_str(), &events).await {
                    return;
                }
            }
            Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    if !forward(text, &events).await {
                        return;
                    }
                }
                Err(_) => warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
            },
            Some(Ok(WsMessage::Close(frame))) => break frame.map(|f| f.reason.to_string()),
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };
    debug!("WebSocket read pump finished: {:?}", reason);
    let _ = events.send(LinkEvent::Closed(reason)).await;
}
