//! Control connection handles
//!
//! A handle is the relay's write side of one agent control connection. The
//! transport task owns the matching receiver and drains it into the socket.

use burrow_proto::ControlMessage;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one control connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// Outbound side of an agent control connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<ControlMessage>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the transport writer drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::new(),
            sender,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message for the agent; fails once the writer has gone away
    pub fn send(&self, msg: ControlMessage) -> Result<(), ControlMessage> {
        self.sender.send(msg).map_err(|e| e.0)
    }
}
