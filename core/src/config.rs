/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST API
    pub api_base_url: String,

    /// WebSocket endpoint carrying the STOMP session
    pub ws_url: String,

    /// Topic prefix; the conversation id is appended
    pub subscribe_prefix: String,

    /// Publish destination prefix; the conversation id is appended
    pub publish_prefix: String,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Give up after this many consecutive failed attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,

    /// Connection handshake timeout
    pub connect_timeout: Duration,

    /// How long a subscribe request may wait for a live connection and its receipt
    pub subscribe_wait: Duration,

    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            ws_url: "ws://localhost:8080/ws".to_string(),
            subscribe_prefix: "/topic/chat/".to_string(),
            publish_prefix: "/app/chat/".to_string(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_attempts: None,
            connect_timeout: Duration::from_secs(10),
            subscribe_wait: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Destination a conversation's pushes arrive on
    pub fn subscribe_destination(&self, conversation_id: i64) -> String {
        format!("{}{}", self.subscribe_prefix, conversation_id)
    }

    /// Destination outbound messages for a conversation are sent to
    pub fn publish_destination(&self, conversation_id: i64) -> String {
        format!("{}{}", self.publish_prefix, conversation_id)
    }

    /// Parse flags from command line arguments.
    ///
    /// Returns the config and the remaining positional arguments (the
    /// program name excluded).
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    config.api_base_url = flag_value(args, i, "--api-url")?.to_string();
                    i += 2;
                }
                "--ws-url" => {
                    config.ws_url = flag_value(args, i, "--ws-url")?.to_string();
                    i += 2;
                }
                "--reconnect-ms" => {
                    let ms = flag_value(args, i, "--reconnect-ms")?
                        .parse::<u64>()
                        .map_err(|_| {
                            ChatError::Config("--reconnect-ms must be a number of milliseconds".to_string())
                        })?;
                    config.reconnect_delay = Duration::from_millis(ms);
                    i += 2;
                }
                "--max-reconnects" => {
                    let n = flag_value(args, i, "--max-reconnects")?
                        .parse::<u32>()
                        .map_err(|_| {
                            ChatError::Config("--max-reconnects must be a positive number".to_string())
                        })?;
                    config.max_reconnect_attempts = Some(n);
                    i += 2;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides
        if let Ok(url) = std::env::var("SWIPECHAT_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("SWIPECHAT_WS_URL") {
            config.ws_url = url;
        }
        if let Some(ms) = std::env::var("SWIPECHAT_RECONNECT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.reconnect_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok((config, positional))
    }

    /// Reject settings the session cannot run with. The client is built
    /// without TLS, so only plain `http://` and `ws://` endpoints work.
    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") {
            return Err(ChatError::Config(format!(
                "API URL must use http:// (TLS is not supported): {}",
                self.api_base_url
            )));
        }
        if !self.ws_url.starts_with("ws://") {
            return Err(ChatError::Config(format!(
                "WebSocket URL must use ws:// (TLS is not supported): {}",
                self.ws_url
            )));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(ChatError::Config(
                "--max-reconnects must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_reconnect_delay_is_five_seconds() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay, Duration::from_millis(5000));
        assert_eq!(config.max_reconnect_attempts, None);
    }

    #[test]
    fn test_destinations() {
        let config = Config::default();
        assert_eq!(config.subscribe_destination(42), "/topic/chat/42");
        assert_eq!(config.publish_destination(42), "/app/chat/42");
    }

    #[test]
    fn test_from_args_flags_and_positionals() {
        let (config, rest) = Config::from_args(&args(&[
            "swipechat",
            "--ws-url",
            "ws://chat.example:9000/ws",
            "chat",
            "--reconnect-ms",
            "250",
            "17",
        ]))
        .unwrap();

        assert_eq!(config.ws_url, "ws://chat.example:9000/ws");
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(rest, vec!["chat".to_string(), "17".to_string()]);
    }

    #[test]
    fn test_from_args_missing_value() {
        let result = Config::from_args(&args(&["swipechat", "--api-url"]));
        assert!(matches!(result, Err(ChatError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let config = Config {
            ws_url: "http://localhost:8080/ws".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tls_endpoints() {
        let https_api = Config {
            api_base_url: "https://127.0.0.1:8443".to_string(),
            ..Default::default()
        };
        assert!(matches!(https_api.validate(), Err(ChatError::Config(_))));

        let wss = Config {
            ws_url: "wss://127.0.0.1:8443/ws".to_string(),
            ..Default::default()
        };
        assert!(matches!(wss.validate(), Err(ChatError::Config(_))));

        assert!(Config::default().validate().is_ok());
    }
}
