//! Request correlator
//!
//! Turns each public HTTP request into a `Request` message on the control
//! connection and parks the caller until the matching `Response` comes back,
//! the deadline passes, or the session carrying the request goes away.
//! Whichever of those three removes the pending entry first decides the
//! outcome; the other two find nothing and do nothing.

use burrow_proto::{ControlMessage, HttpRequest, HttpResponse, RequestId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionId;
use crate::registry::{ForwardError, SessionRegistry};

/// Why a submitted request produced no agent response
#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    /// No agent attached when the request arrived
    #[error("No agent attached")]
    NoSession,

    /// The agent accepted the request but did not answer in time
    #[error("Agent did not respond within {0:?}")]
    TimedOut(Duration),

    /// The session carrying the request went away before it was answered
    #[error("Request failed: {0}")]
    Failed(String),
}

enum Resolution {
    Response(HttpResponse),
    Failed(String),
}

struct PendingRequest {
    connection_id: ConnectionId,
    deadline: Instant,
    sender: oneshot::Sender<Resolution>,
}

/// Tracks requests sent to the agent and routes responses back to their callers
pub struct RequestCorrelator {
    registry: Arc<SessionRegistry>,
    /// Maps request id -> waiter; keys are unique at all times
    pending: DashMap<RequestId, PendingRequest>,
}

impl RequestCorrelator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send a request to the attached agent and wait for its response
    ///
    /// Fails fast with `NoSession` when no agent is attached. Dropping the
    /// returned future removes the pending entry as well.
    pub async fn submit(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, SubmitError> {
        let session = self
            .registry
            .current_session()
            .ok_or(SubmitError::NoSession)?;

        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        let id = self.register(session.connection_id, deadline, tx);

        // Removes the entry on every exit path, including cancellation
        let _cleanup = scopeguard::guard(id, |id| {
            if self.pending.remove(&id).is_some() {
                trace!(request_id = %id, "Removed abandoned pending request");
            }
        });

        debug!(
            request_id = %id,
            agent_id = %session.identity,
            method = %request.method,
            path = %request.path,
            "Dispatching request to agent"
        );

        let msg = ControlMessage::Request { id, request };
        match self.registry.forward_to(session.connection_id, msg) {
            Ok(_) => {}
            Err(ForwardError::NoSession) => return Err(SubmitError::NoSession),
            Err(ForwardError::ConnectionClosed(connection_id)) => {
                return Err(SubmitError::Failed(format!(
                    "connection {} closed before dispatch",
                    connection_id
                )));
            }
        }

        let resolution = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(result) => result.ok(),
            Err(_) => {
                if self.pending.remove(&id).is_some() {
                    warn!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    return Err(SubmitError::TimedOut(timeout));
                }
                // Another trigger removed the entry first; its value is in flight.
                rx.await.ok()
            }
        };

        match resolution {
            Some(Resolution::Response(response)) => Ok(response),
            Some(Resolution::Failed(reason)) => Err(SubmitError::Failed(reason)),
            None => Err(SubmitError::TimedOut(timeout)),
        }
    }

    fn register(
        &self,
        connection_id: ConnectionId,
        deadline: Instant,
        sender: oneshot::Sender<Resolution>,
    ) -> RequestId {
        loop {
            let id = RequestId::random();
            match self.pending.entry(id) {
                Entry::Occupied(_) => {
                    warn!(request_id = %id, "Correlation id collision, regenerating");
                }
                Entry::Vacant(slot) => {
                    slot.insert(PendingRequest {
                        connection_id,
                        deadline,
                        sender,
                    });
                    trace!(request_id = %id, "Registered pending request");
                    return id;
                }
            }
        }
    }

    /// Deliver a response from the agent
    ///
    /// Returns true if a waiting caller received it. Responses for unknown,
    /// timed-out or already-answered ids are discarded.
    pub fn resolve(&self, id: RequestId, response: HttpResponse) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            debug!(request_id = %id, "Discarding response for unknown or finished request");
            return false;
        };

        trace!(
            request_id = %id,
            status = response.status,
            remaining_ms = pending
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            "Routing response"
        );

        if pending.sender.send(Resolution::Response(response)).is_err() {
            debug!(request_id = %id, "Caller went away before response arrived");
            return false;
        }
        true
    }

    /// Fail a single pending request that can never reach the agent
    ///
    /// Returns true if a waiting caller was failed; finished ids are ignored.
    pub fn fail_request(&self, id: RequestId, reason: impl Into<String>) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            return false;
        };

        let reason = reason.into();
        warn!(request_id = %id, "Failing request: {}", reason);
        pending.sender.send(Resolution::Failed(reason)).is_ok()
    }

    /// Fail every request still pending on `connection_id`
    ///
    /// Called after the connection's session has been detached. Returns the
    /// number of requests failed.
    pub fn fail_connection(&self, connection_id: ConnectionId) -> usize {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&id, |_, p| p.connection_id == connection_id)
            {
                let _ = pending.sender.send(Resolution::Failed(
                    "agent disconnected before responding".to_string(),
                ));
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(
                connection_id = %connection_id,
                failed_requests = failed,
                "Failed in-flight requests after agent disconnect"
            );
        }
        failed
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
