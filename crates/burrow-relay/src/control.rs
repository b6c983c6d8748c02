//! Agent control connection handling
//!
//! One WebSocket per agent. The first frame must be `Connect`; after the
//! credential is verified and the session slot is taken, the connection
//! carries `Request`/`Response` traffic and keepalives until either side goes
//! away. Leaving the loop always detaches the session and fails whatever was
//! still pending on it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use burrow_auth::{credential_fingerprint, AgentIdentity};
use burrow_control::{AttachError, ConnectionHandle, ConnectionId};
use burrow_proto::{
    ControlCodec, ControlMessage, RejectReason, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::server::RelayState;

/// `GET /_burrow/connect`
pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<RelayState>) {
    let credential = match timeout(state.config.handshake_timeout, read_connect(&mut socket)).await
    {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            debug!("Control connection closed before handshake");
            return;
        }
        Err(_) => {
            warn!("Agent did not complete the handshake in time");
            close(&mut socket).await;
            return;
        }
    };

    let fingerprint = credential_fingerprint(&credential);

    let identity = match state.verifier.verify(&credential).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(
                credential_fingerprint = %fingerprint,
                "Agent authentication failed: {}", e
            );
            reject(&mut socket, RejectReason::AuthFailure, e.to_string()).await;
            return;
        }
    };

    let (handle, outbound) = ConnectionHandle::new();
    let connection_id = handle.id();

    if let Err(AttachError::AlreadyAttached { current }) =
        state.registry.attach(identity.clone(), handle)
    {
        warn!(
            agent_id = %identity,
            current_agent = %current,
            credential_fingerprint = %fingerprint,
            "Rejecting agent: another agent is already attached"
        );
        reject(
            &mut socket,
            RejectReason::AlreadyAttached,
            format!("Agent '{}' is already attached", current),
        )
        .await;
        return;
    }

    let connected = ControlMessage::Connected {
        agent_id: identity.to_string(),
    };
    if send(&mut socket, &connected).await.is_err() {
        warn!(agent_id = %identity, "Failed to confirm attach; dropping session");
        teardown(&state, &identity, connection_id, "handshake reply failed");
        return;
    }

    info!(
        agent_id = %identity,
        connection_id = %connection_id,
        credential_fingerprint = %fingerprint,
        "✅ Agent attached"
    );

    let reason = serve(socket, &state, connection_id, outbound).await;
    teardown(&state, &identity, connection_id, &reason);
}

/// Wait for the agent's `Connect` frame; `None` if the connection ends first
async fn read_connect(socket: &mut WebSocket) -> Option<String> {
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Binary(data)) => {
                return match ControlCodec::decode(&data) {
                    Ok(ControlMessage::Connect {
                        credential,
                        protocol_version,
                        metadata,
                    }) => {
                        if protocol_version != PROTOCOL_VERSION {
                            warn!(
                                "Agent speaks protocol v{}, relay speaks v{}",
                                protocol_version, PROTOCOL_VERSION
                            );
                        }
                        debug!(
                            "Agent host: {} ({}, v{})",
                            metadata.hostname, metadata.platform, metadata.version
                        );
                        Some(credential)
                    }
                    // Anything else carries no credential and fails verification
                    Ok(other) => {
                        warn!("Expected 'connect' as first message, got '{}'", other.kind());
                        Some(String::new())
                    }
                    Err(e) => {
                        warn!("Undecodable handshake frame: {}", e);
                        Some(String::new())
                    }
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Relay traffic for an attached session; returns why it ended
async fn serve(
    socket: WebSocket,
    state: &RelayState,
    connection_id: ConnectionId,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<ControlMessage>,
) -> String {
    let (mut sink, mut stream) = socket.split();
    let idle_timeout = state.config.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;

    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let bye = ControlMessage::Disconnect {
                    reason: "relay shutting down".to_string(),
                };
                if let Ok(frame) = ControlCodec::encode(&bye) {
                    let _ = sink.send(Message::Binary(frame)).await;
                }
                break "relay shutting down".to_string();
            }

            Some(msg) = outbound.recv() => {
                let frame = match ControlCodec::encode(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode '{}' for agent: {}", msg.kind(), e);
                        // The agent never sees it, so its caller must not wait
                        if let ControlMessage::Request { id, .. } = msg {
                            state
                                .correlator
                                .fail_request(id, format!("request not delivered: {}", e));
                        }
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    break format!("send failed: {}", e);
                }
            }

            _ = sleep_until(idle_deadline) => {
                break format!("no message from agent for {}s", idle_timeout.as_secs());
            }

            frame = stream.next() => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break "agent closed the connection".to_string(),
                    Some(Ok(_)) => {
                        idle_deadline = Instant::now() + idle_timeout;
                        continue;
                    }
                    Some(Err(e)) => break format!("transport error: {}", e),
                };
                idle_deadline = Instant::now() + idle_timeout;

                let msg = match ControlCodec::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Dropping undecodable frame from agent: {}", e);
                        continue;
                    }
                };

                match msg {
                    ControlMessage::Response { id, response } => {
                        // Unknown and finished ids are discarded by the correlator
                        state.correlator.resolve(id, response);
                    }
                    ControlMessage::Keepalive { timestamp } => {
                        state.registry.record_liveness(connection_id);
                        let ack = ControlMessage::KeepaliveAck { timestamp };
                        if let Ok(frame) = ControlCodec::encode(&ack) {
                            if let Err(e) = sink.send(Message::Binary(frame)).await {
                                break format!("send failed: {}", e);
                            }
                        }
                    }
                    ControlMessage::Disconnect { reason } => {
                        break format!("agent disconnected: {}", reason);
                    }
                    other => {
                        warn!("Ignoring unexpected '{}' message from agent", other.kind());
                    }
                }
            }
        }
    };

    let _ = sink.close().await;
    reason
}

/// Detach the session (if still ours) and fail its pending requests
fn teardown(state: &RelayState, identity: &AgentIdentity, connection_id: ConnectionId, reason: &str) {
    let detached = state.registry.detach(connection_id).is_some();
    let failed = state.correlator.fail_connection(connection_id);

    if detached {
        info!(
            agent_id = %identity,
            connection_id = %connection_id,
            failed_requests = failed,
            "Agent detached: {}", reason
        );
    } else {
        debug!(connection_id = %connection_id, "Stale connection closed: {}", reason);
    }
}

async fn send(socket: &mut WebSocket, msg: &ControlMessage) -> Result<(), ()> {
    let frame = ControlCodec::encode(msg).map_err(|_| ())?;
    socket.send(Message::Binary(frame)).await.map_err(|_| ())
}

async fn reject(socket: &mut WebSocket, reason: RejectReason, message: String) {
    let _ = send(socket, &ControlMessage::Rejected { reason, message }).await;
    close(socket).await;
}

async fn close(socket: &mut WebSocket) {
    let _ = socket.send(Message::Close(None)).await;
}
