//! Minimal STOMP 1.2 framing between the party channel and the broker.
//!
//! Wire format (text, NUL-terminated):
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! Only the subset the watch-party transport needs: no transactions, acks,
//! receipts or heart-beats.

/// Frame commands, client- and server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Disconnect,
    Error,
}

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Disconnect => "DISCONNECT",
            Command::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Command> {
        match raw {
            "CONNECT" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "SEND" => Some(Command::Send),
            "MESSAGE" => Some(Command::Message),
            "DISCONNECT" => Some(Command::Disconnect),
            "ERROR" => Some(Command::Error),
            _ => None,
        }
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for a header name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str) -> Frame {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
    }

    pub fn connected() -> Frame {
        Frame::new(Command::Connected).header("version", "1.2")
    }

    pub fn subscribe(id: &str, destination: &str) -> Frame {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
    }

    pub fn unsubscribe(id: &str) -> Frame {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Frame {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn message(destination: &str, subscription: &str, body: impl Into<String>) -> Frame {
        Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", subscription)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect() -> Frame {
        Frame::new(Command::Disconnect)
    }

    pub fn error(message: &str) -> Frame {
        Frame::new(Command::Error).header("message", message)
    }

    /// Serialize to the text wire form.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse a frame from the text wire form.
    pub fn decode(raw: &str) -> Result<Frame, StompError> {
        let raw = raw.strip_suffix('\0').ok_or(StompError::MissingTerminator)?;

        let (head, body) = match raw.split_once("\n\n") {
            Some((head, body)) => (head, body),
            None => (raw, ""),
        };

        let mut lines = head.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command_line = lines.next().filter(|l| !l.is_empty()).ok_or(StompError::EmptyFrame)?;
        let command = Command::parse(command_line)
            .ok_or_else(|| StompError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Frame {
            command,
            headers,
            body: body.to_string(),
        })
    }
}

/// Framing errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StompError {
    MissingTerminator,
    EmptyFrame,
    UnknownCommand(String),
    MalformedHeader(String),
}

impl std::fmt::Display for StompError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTerminator => write!(f, "Frame is not NUL-terminated"),
            Self::EmptyFrame => write!(f, "Frame has no command line"),
            Self::UnknownCommand(c) => write!(f, "Unknown command `{c}`"),
            Self::MalformedHeader(h) => write!(f, "Malformed header line `{h}`"),
        }
    }
}

impl std::error::Error for StompError {}
