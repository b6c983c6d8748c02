//! Control connection message types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation identifier tagging a request/response pair on the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier (122 bits of entropy)
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    // Handshake
    /// Agent presents its credential; always the first frame on a new connection
    Connect {
        credential: String,
        protocol_version: u32,
        metadata: AgentMetadata,
    },
    /// Relay accepted the agent and attached it as the active session
    Connected { agent_id: String },
    /// Relay refused the agent; the connection is closed right after
    Rejected {
        reason: RejectReason,
        message: String,
    },

    // Data
    /// Relay asks the agent to execute a public HTTP request
    Request { id: RequestId, request: HttpRequest },
    /// Agent returns the local service's answer (or a synthesized failure)
    Response { id: RequestId, response: HttpResponse },

    // Liveness
    Keepalive { timestamp: u64 },
    KeepaliveAck { timestamp: u64 },

    /// Terminal for the session, sent by either side
    Disconnect { reason: String },
}

impl ControlMessage {
    /// Short name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Connect { .. } => "connect",
            ControlMessage::Connected { .. } => "connected",
            ControlMessage::Rejected { .. } => "rejected",
            ControlMessage::Request { .. } => "request",
            ControlMessage::Response { .. } => "response",
            ControlMessage::Keepalive { .. } => "keepalive",
            ControlMessage::KeepaliveAck { .. } => "keepalive_ack",
            ControlMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// Why the relay refused a connecting agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    /// Missing, malformed, expired or wrongly scoped credential
    AuthFailure,
    /// Another agent already holds the single session slot
    AlreadyAttached,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AuthFailure => f.write_str("authentication failed"),
            RejectReason::AlreadyAttached => f.write_str("another agent is already attached"),
        }
    }
}

/// A public HTTP request as carried through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path including the query string, e.g. `/status?verbose=1`
    pub path: String,
    /// Header values are raw bytes; they need not be valid UTF-8
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// The local service's answer as carried back through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Plain-text response used when the agent has to answer on the service's behalf
    pub fn synthesized(status: u16, message: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_header("x-burrow-error", "true")
            .with_body(message.into().into_bytes())
    }

    /// Case-insensitive header lookup (first match)
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }
}

/// Agent host information, logged by the relay on attach
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String,
    pub version: String,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
