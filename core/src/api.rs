/// REST collaborator: history fetch, conversation list, login and read
/// receipts over bearer-authenticated HTTP
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::types::{ConversationSummary, LoginResponse, Message};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What the switchboard needs from the backend besides the stream
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Ordered history of one conversation
    async fn fetch_history(&self, conversation_id: i64) -> Result<Vec<Message>>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn mark_notification_read(&self, notification_id: i64) -> Result<()>;
}

pub struct HttpChatApi {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    token: RwLock<Option<String>>,
    timeout: Duration,
}

impl HttpChatApi {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            timeout: config.request_timeout,
        }
    }

    /// Same as `new` with a bearer token already known
    pub fn with_token(config: &Config, token: impl Into<String>) -> Self {
        let mut api = Self::new(config);
        api.token = RwLock::new(Some(token.into()));
        api
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Exchange login and password for a bearer token. The token is kept for
    /// every later request.
    pub async fn login(&self, login: &str, password: &str) -> Result<LoginResponse> {
        let body = serde_json::json!({ "login": login, "password": password }).to_string();
        let bytes = self.execute(Method::POST, "/login", Some(body), false).await?;
        let response: LoginResponse = serde_json::from_slice(&bytes)?;
        *self.token.write().await = Some(response.token.clone());
        info!("Logged in as {} (user {})", response.username, response.id);
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        let bytes = self.execute(Method::GET, path, None, true).await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        authenticated: bool,
    ) -> Result<Bytes> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&url)
            .header(ACCEPT, "application/json");

        if authenticated {
            match self.token.read().await.as_deref() {
                Some(token) => {
                    builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
                }
                None => return Err(ChatError::AuthRejected("no bearer token".to_string())),
            }
        }

        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(json))),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| ChatError::Config(format!("invalid request {}: {}", url, e)))?;

        debug!("{} {}", method, url);
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ChatError::Timeout(format!("{} {}", method, url)))?
            .map_err(|e| ChatError::Network(format!("{} {}: {}", method, url, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Network(format!("reading {} body: {}", url, e)))?
            .to_bytes();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("{} {} rejected with {}", method, url, status);
            return Err(ChatError::AuthRejected(format!("{} {}", method, url)));
        }
        if !status.is_success() {
            return Err(ChatError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let path = format!("/chat/{}", conversation_id);
        self.get_json(&path)
            .await
            .map_err(|e| ChatError::HistoryFetchFailed(e.to_string()))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.get_json("/chat/conversations").await
    }

    async fn mark_notification_read(&self, notification_id: i64) -> Result<()> {
        let path = format!("/notifications/read/{}", notification_id);
        self.execute(Method::POST, &path, None, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let config = Config {
            api_base_url: "http://example.test:8080/".to_string(),
            ..Config::default()
        };
        let api = HttpChatApi::new(&config);
        assert_eq!(api.base_url, "http://example.test:8080");
    }

    #[tokio::test]
    async fn test_authenticated_call_without_token() {
        let api = HttpChatApi::new(&Config::default());
        let result = api.list_conversations().await;
        assert!(matches!(result, Err(ChatError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_history_errors_are_wrapped() {
        let api = HttpChatApi::new(&Config::default());
        let result = api.fetch_history(42).await;
        assert!(matches!(result, Err(ChatError::HistoryFetchFailed(_))));
    }

    #[tokio::test]
    async fn test_with_token() {
        let api = HttpChatApi::with_token(&Config::default(), "abc");
        assert_eq!(api.token().await.as_deref(), Some("abc"));
    }
}
