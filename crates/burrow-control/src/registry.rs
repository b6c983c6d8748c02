//! Session registry for the single attached agent
//!
//! The relay serves exactly one agent at a time. The registry owns that one
//! session slot; every read and mutation goes through the methods below,
//! which serialize on a single lock so exclusivity and stale-handle checks
//! cannot race each other.

use burrow_auth::AgentIdentity;
use burrow_proto::ControlMessage;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::connection::{ConnectionHandle, ConnectionId};

/// The relay's record of the attached agent
#[derive(Debug)]
pub struct Session {
    pub identity: AgentIdentity,
    /// Connection handle; never leaves the registry
    handle: ConnectionHandle,
    pub attached_at: DateTime<Utc>,
    pub last_liveness: DateTime<Utc>,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            connection_id: self.handle.id(),
            attached_at: self.attached_at,
            last_liveness: self.last_liveness,
        }
    }
}

/// Read-only view of the attached session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identity: AgentIdentity,
    pub connection_id: ConnectionId,
    pub attached_at: DateTime<Utc>,
    pub last_liveness: DateTime<Utc>,
}

/// Attach rejections
#[derive(Debug, Error, PartialEq)]
pub enum AttachError {
    #[error("Agent {current} is already attached")]
    AlreadyAttached { current: AgentIdentity },
}

/// Forwarding failures
#[derive(Debug, Error, PartialEq)]
pub enum ForwardError {
    #[error("No agent attached")]
    NoSession,

    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),
}

/// Holds at most one active agent session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    slot: Mutex<Option<Session>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        tracing::debug!("Creating session registry");
        Self {
            slot: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Session>> {
        // The slot holds plain data; a panic elsewhere cannot leave it half-written.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach an authenticated agent
    ///
    /// # Errors
    ///
    /// Returns `AlreadyAttached` if a session exists. The existing session is
    /// left untouched; the caller must close the offending connection.
    pub fn attach(
        &self,
        identity: AgentIdentity,
        handle: ConnectionHandle,
    ) -> Result<SessionSnapshot, AttachError> {
        let mut slot = self.slot();

        if let Some(current) = slot.as_ref() {
            tracing::warn!(
                agent_id = %identity,
                current_agent_id = %current.identity,
                current_connection_id = %current.connection_id(),
                "Rejecting agent: session slot already taken"
            );
            return Err(AttachError::AlreadyAttached {
                current: current.identity.clone(),
            });
        }

        let now = Utc::now();
        let session = Session {
            identity,
            handle,
            attached_at: now,
            last_liveness: now,
        };
        let snapshot = session.snapshot();

        tracing::info!(
            agent_id = %snapshot.identity,
            connection_id = %snapshot.connection_id,
            "Agent session attached"
        );

        *slot = Some(session);
        Ok(snapshot)
    }

    /// Remove the session, but only if `connection_id` is the attached one
    ///
    /// A disconnect event from an old connection that lost a race with a
    /// newer attach returns `None` and leaves the newer session in place.
    pub fn detach(&self, connection_id: ConnectionId) -> Option<Session> {
        let mut slot = self.slot();

        match slot.as_ref() {
            Some(current) if current.connection_id() == connection_id => {
                let session = slot.take();
                if let Some(ref session) = session {
                    tracing::info!(
                        agent_id = %session.identity,
                        connection_id = %connection_id,
                        attached_secs = (Utc::now() - session.attached_at).num_seconds(),
                        "Agent session detached"
                    );
                }
                session
            }
            Some(current) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    current_connection_id = %current.connection_id(),
                    "Ignoring detach for stale connection"
                );
                None
            }
            None => {
                tracing::debug!(connection_id = %connection_id, "Detach with no session attached");
                None
            }
        }
    }

    /// Record a keepalive for the session; no-op for stale connections
    pub fn record_liveness(&self, connection_id: ConnectionId) -> bool {
        let mut slot = self.slot();

        match slot.as_mut() {
            Some(session) if session.connection_id() == connection_id => {
                session.last_liveness = Utc::now();
                tracing::trace!(connection_id = %connection_id, "Recorded keepalive");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the attached session, if any
    pub fn current_session(&self) -> Option<SessionSnapshot> {
        self.slot().as_ref().map(Session::snapshot)
    }

    pub fn is_attached(&self) -> bool {
        self.slot().is_some()
    }

    /// Send a message to whichever agent is attached
    ///
    /// Returns the connection the message was queued on.
    pub fn forward(&self, msg: ControlMessage) -> Result<ConnectionId, ForwardError> {
        let slot = self.slot();
        let session = slot.as_ref().ok_or(ForwardError::NoSession)?;
        Self::send_on(session, msg)
    }

    /// Send a message only if `connection_id` is still the attached connection
    pub fn forward_to(
        &self,
        connection_id: ConnectionId,
        msg: ControlMessage,
    ) -> Result<ConnectionId, ForwardError> {
        let slot = self.slot();
        match slot.as_ref() {
            Some(session) if session.connection_id() == connection_id => {
                Self::send_on(session, msg)
            }
            _ => Err(ForwardError::NoSession),
        }
    }

    fn send_on(session: &Session, msg: ControlMessage) -> Result<ConnectionId, ForwardError> {
        let connection_id = session.connection_id();
        session
            .handle
            .send(msg)
            .map_err(|_| ForwardError::ConnectionClosed(connection_id))?;
        Ok(connection_id)
    }
}
