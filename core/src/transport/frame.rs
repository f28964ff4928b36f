/// STOMP 1.2 frame codec
use crate::error::{ChatError, Result};
use std::fmt;

/// Protocol version offered in CONNECT
pub const STOMP_VERSION: &str = "1.2";

/// Frame commands used by the client and its server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are not escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame with a UTF-8 body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Builder-style header
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, bearer: &str) -> Self {
        StompFrame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0")
            .header("Authorization", format!("Bearer {}", bearer))
    }

    pub fn subscribe(id: &str, destination: &str, receipt: Option<&str>) -> Self {
        let frame = StompFrame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto");
        match receipt {
            Some(r) => frame.header("receipt", r),
            None => frame,
        }
    }

    pub fn unsubscribe(id: &str) -> Self {
        StompFrame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, json: String) -> Self {
        StompFrame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(json)
    }

    /// Serialize to wire text (NUL terminated)
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from wire text.
    ///
    /// Returns `Ok(None)` for heart-beats (text that is only end-of-lines).
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() || text == "\0" {
            return Ok(None);
        }

        let (head, rest) = split_head(text)
            .ok_or_else(|| ChatError::Protocol("frame has no header terminator".to_string()))?;

        let mut lines = head.lines();
        let command_line = lines.next().unwrap_or_default().trim_end_matches('\r');
        let command = Command::parse(command_line)
            .ok_or_else(|| ChatError::Protocol(format!("unknown command {:?}", command_line)))?;

        let escape = command.escapes_headers();
        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ChatError::Protocol(format!("malformed header {:?}", line)))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let frame = StompFrame {
            command,
            headers,
            body: String::new(),
        };

        let body = match frame.get("content-length") {
            Some(len) => {
                let len = len
                    .parse::<usize>()
                    .map_err(|_| ChatError::Protocol(format!("bad content-length {:?}", len)))?;
                rest.get(..len)
                    .ok_or_else(|| ChatError::Protocol("body shorter than content-length".to_string()))?
            }
            None => rest.split('\0').next().unwrap_or_default(),
        };

        Ok(Some(frame.with_body(body)))
    }
}

impl fmt::Display for StompFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.command)
    }
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    let lf = text.find("\n\n");
    let crlf = text.find("\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((&text[..b], &text[b + 4..])),
        (Some(a), _) => Some((&text[..a], &text[a + 2..])),
        (None, Some(b)) => Some((&text[..b], &text[b + 4..])),
        (None, None) => None,
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(ChatError::Protocol(format!(
                    "undefined escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_encoding() {
        let frame = StompFrame::send("/app/chat/42", r#"{"content":"hi"}"#.to_string());
        let wire = frame.encode();
        assert!(wire.starts_with("SEND\ndestination:/app/chat/42\n"));
        assert!(wire.contains("content-length:16\n"));
        assert!(wire.ends_with("\n\n{\"content\":\"hi\"}\0"));
    }

    #[test]
    fn test_message_frame_decoding() {
        let wire = "MESSAGE\nsubscription:sub-1\ndestination:/topic/chat/42\nmessage-id:9\n\n{\"messageId\":1}\0";
        let frame = StompFrame::decode(wire).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-1"));
        assert_eq!(frame.body, "{\"messageId\":1}");
    }

    #[test]
    fn test_header_escaping_survives_the_wire() {
        let frame = StompFrame::new(Command::Error).header("message", "bad: token\nexpired");
        let wire = frame.encode();
        assert!(wire.contains("message:bad\\c token\\nexpired\n"));
        let parsed = StompFrame::decode(&wire).unwrap().unwrap();
        assert_eq!(parsed.get("message"), Some("bad: token\nexpired"));
    }

    #[test]
    fn test_connect_headers_are_not_escaped() {
        let wire = StompFrame::connect("localhost", "abc").encode();
        assert!(wire.contains("Authorization:Bearer abc\n"));
    }

    #[test]
    fn test_heartbeat_is_skipped() {
        assert_eq!(StompFrame::decode("\n").unwrap(), None);
        assert_eq!(StompFrame::decode("\r\n\r\n").unwrap(), None);
    }

    #[test]
    fn test_first_repeated_header_wins() {
        let wire = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frame = StompFrame::decode(wire).unwrap().unwrap();
        assert_eq!(frame.get("foo"), Some("first"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(StompFrame::decode("BOGUS\n\n\0").is_err());
        assert!(StompFrame::decode("MESSAGE\nno-terminator").is_err());
        assert!(StompFrame::decode("MESSAGE\nbroken\n\n\0").is_err());
        assert!(StompFrame::decode("ERROR\nmessage:a\\tb\n\n\0").is_err());
    }
}
