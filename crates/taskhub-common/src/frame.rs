//! STOMP 1.2 text frame codec.
//!
//! Only the subset the dashboard stream needs is modelled: the client
//! frames `CONNECT`, `SUBSCRIBE`, `UNSUBSCRIBE`, `DISCONNECT` and the server
//! frames `CONNECTED`, `MESSAGE`, `RECEIPT`, `ERROR`. Each WebSocket text
//! message carries exactly one frame, or a bare end-of-line heartbeat.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Protocol version advertised in `accept-version` / `version` headers.
pub const STOMP_VERSION: &str = "1.2";

/// Heartbeat payload: a single end-of-line.
pub const HEARTBEAT: &str = "\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("invalid escape sequence '\\{0}' in header")]
    InvalidEscape(char),

    #[error("frame has no blank line between headers and body")]
    MissingBodySeparator,

    #[error("frame body is not NUL-terminated")]
    Unterminated,

    #[error("content-length {expected} exceeds body of {actual} bytes")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// CONNECT and CONNECTED headers are never escaped (STOMP 1.2 §"Value Encoding").
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompCommand {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "STOMP" => Ok(Self::Stomp),
            "CONNECTED" => Ok(Self::Connected),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            "DISCONNECT" => Ok(Self::Disconnect),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// A decoded WebSocket text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(Frame),
}

impl Frame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`. Repeated headers keep the first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

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
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode a single WebSocket text message.
    ///
    /// Leading end-of-lines are heartbeats that may precede a frame; a
    /// message consisting only of end-of-lines is itself a heartbeat.
    pub fn decode(text: &str) -> Result<Inbound, FrameError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(Inbound::Heartbeat);
        }

        let mut offset = 0;
        let mut head = Vec::new();
        let mut body_start = None;
        for line in text.split_inclusive('\n') {
            offset += line.len();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if line.is_empty() {
                body_start = Some(offset);
                break;
            }
            head.push(line);
        }
        let body_start = body_start.ok_or(FrameError::MissingBodySeparator)?;

        let mut head = head.into_iter();
        let command: StompCommand = head.next().ok_or(FrameError::Empty)?.parse()?;
        let escaped = command.escapes_headers();

        let mut headers = Vec::new();
        for line in head {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escaped {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &text[body_start..];
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());
        let body = match content_length {
            Some(len) => rest
                .get(..len)
                .ok_or(FrameError::Truncated {
                    expected: len,
                    actual: rest.len(),
                })?
                .to_string(),
            None => {
                let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
                rest[..end].to_string()
            }
        };

        Ok(Inbound::Frame(Frame {
            command,
            headers,
            body,
        }))
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(FrameError::InvalidEscape(other)),
            None => return Err(FrameError::InvalidEscape(' ')),
        }
    }
    Ok(out)
}

// ── Heart-beating ─────────────────────────────────────────────────────

/// Parse a `heart-beat:<cx>,<cy>` header value into milliseconds.
pub fn parse_heart_beat(value: &str) -> Option<(u64, u64)> {
    let (outgoing, incoming) = value.split_once(',')?;
    Some((outgoing.trim().parse().ok()?, incoming.trim().parse().ok()?))
}

/// Effective interval for one direction: zero when either side declines,
/// otherwise the slower of the two.
pub fn negotiate_heart_beat(sender_can: u64, receiver_wants: u64) -> u64 {
    if sender_can == 0 || receiver_wants == 0 {
        0
    } else {
        sender_can.max(receiver_wants)
    }
}
