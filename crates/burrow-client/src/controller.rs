//! Agent connection lifecycle
//!
//! The controller owns the control connection to the relay: it connects,
//! authenticates, serves tunneled requests while connected, and reconnects on
//! a fixed interval whenever the connection is lost or refused.

use burrow_proto::{
    AgentMetadata, CodecError, ControlCodec, ControlMessage, HttpResponse, RejectReason,
    PROTOCOL_VERSION,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AgentConfig;
use crate::forwarder::{LocalService, RequestForwarder};
use crate::liveness::KeepaliveMonitor;
use crate::reconnect::ReconnectTimer;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Agent-side connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Agent errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Timed out connecting to relay")]
    ConnectTimeout,

    #[error("Relay rejected the agent ({reason}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Control connection lost: {0}")]
    TransportLost(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Drives the agent's control connection until shutdown
pub struct ConnectionController {
    config: AgentConfig,
    forwarder: RequestForwarder,
    metadata: AgentMetadata,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionController {
    pub fn new(config: AgentConfig, service: Arc<dyn LocalService>) -> Self {
        let forwarder = RequestForwarder::new(service, config.request_timeout);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            forwarder,
            metadata: AgentMetadata::default(),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state();
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Connection state: {:?} -> {:?}", previous, next);
        }
    }

    /// Run the connect/serve/reconnect loop until `shutdown` is cancelled
    ///
    /// Only configuration errors end the loop early; every connection failure,
    /// including an authentication rejection, is retried after the reconnect
    /// interval.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let url = self.config.control_url()?;
        let mut timer = ReconnectTimer::new(self.config.reconnect_interval);
        let mut first_attempt = true;

        info!("Agent starting, relay: {}", url);

        loop {
            if !first_attempt {
                timer.arm();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.wait() => {}
                }
            }
            first_attempt = false;

            self.transition(ConnectionState::Connecting);

            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout, self.connect(&url)) => {
                    result.unwrap_or(Err(ClientError::ConnectTimeout))
                }
            };

            match attempt {
                Ok((ws, agent_id)) => {
                    timer.reset();
                    self.transition(ConnectionState::Connected);
                    info!("✅ Connected to relay as agent '{}'", agent_id);

                    match self.run_session(ws, &shutdown).await {
                        Ok(()) => info!("Control connection closed"),
                        Err(e) => warn!("{}", e),
                    }
                }
                Err(ClientError::Rejected { reason, message }) => {
                    error!("❌ Relay rejected the agent ({}): {}", reason, message);
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                }
            }

            self.transition(ConnectionState::Disconnected);

            if shutdown.is_cancelled() {
                break;
            }

            info!(
                "Reconnecting in {}s (attempt {})",
                timer.interval().as_secs_f32(),
                timer.attempt() + 1
            );
        }

        self.transition(ConnectionState::Disconnected);
        info!("Agent stopped");
        Ok(())
    }

    /// Open the WebSocket and complete the credential handshake
    async fn connect(&self, url: &Url) -> Result<(RelayStream, String), ClientError> {
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let hello = ControlMessage::Connect {
            credential: self.config.credential.clone(),
            protocol_version: PROTOCOL_VERSION,
            metadata: self.metadata.clone(),
        };
        ws.send(binary(ControlCodec::encode(&hello)?))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return match ControlCodec::decode(&data)? {
                        ControlMessage::Connected { agent_id } => Ok((ws, agent_id)),
                        ControlMessage::Rejected { reason, message } => {
                            Err(ClientError::Rejected { reason, message })
                        }
                        other => Err(ClientError::Handshake(format!(
                            "unexpected '{}' message",
                            other.kind()
                        ))),
                    };
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ClientError::Handshake(
                        "relay closed the connection".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ClientError::TransportLost(e.to_string())),
            }
        }
    }

    /// Serve one established connection
    ///
    /// Returns `Ok` on shutdown and `TransportLost` for every other exit.
    async fn run_session(
        &self,
        ws: RelayStream,
        shutdown: &CancellationToken,
    ) -> Result<(), ClientError> {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let mut monitor = KeepaliveMonitor::new(self.config.liveness_timeout);
        let mut tasks = JoinSet::new();

        let period = self.config.keepalive_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let bye = ControlMessage::Disconnect {
                        reason: "agent shutting down".to_string(),
                    };
                    if let Ok(frame) = ControlCodec::encode(&bye) {
                        let _ = sink.send(binary(frame)).await;
                    }
                    let _ = sink.close().await;
                    break Ok(());
                }

                Some(msg) = outbound_rx.recv() => {
                    let frame = match encode_outbound(msg) {
                        Ok(frame) => frame,
                        Err(e) => break Err(e.into()),
                    };
                    if let Err(e) = sink.send(binary(frame)).await {
                        break Err(ClientError::TransportLost(e.to_string()));
                    }
                }

                _ = ticker.tick() => {
                    if monitor.is_stale() {
                        break Err(ClientError::TransportLost(format!(
                            "no message from relay for {}s",
                            monitor.idle_for().as_secs()
                        )));
                    }
                    if let Some(keepalive) = monitor.keepalive(self.state()) {
                        let frame = match ControlCodec::encode(&keepalive) {
                            Ok(frame) => frame,
                            Err(e) => break Err(e.into()),
                        };
                        if let Err(e) = sink.send(binary(frame)).await {
                            break Err(ClientError::TransportLost(e.to_string()));
                        }
                        debug!("Sent keepalive");
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            monitor.record_activity();
                            let msg = match ControlCodec::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    warn!("Dropping undecodable frame: {}", e);
                                    continue;
                                }
                            };

                            match msg {
                                ControlMessage::Request { id, request } => {
                                    let forwarder = self.forwarder.clone();
                                    let outbound = outbound_tx.clone();
                                    tasks.spawn(async move {
                                        let response = forwarder.handle(id, request).await;
                                        let _ = outbound.send(response);
                                    });
                                }
                                ControlMessage::KeepaliveAck { timestamp } => {
                                    debug!("Keepalive acknowledged ({})", timestamp);
                                }
                                ControlMessage::Disconnect { reason } => {
                                    break Err(ClientError::TransportLost(format!(
                                        "relay disconnected: {}",
                                        reason
                                    )));
                                }
                                other => {
                                    warn!("Ignoring unexpected '{}' message", other.kind());
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(ClientError::TransportLost(
                                "relay closed the connection".to_string(),
                            ));
                        }
                        Some(Ok(_)) => monitor.record_activity(),
                        Some(Err(e)) => break Err(ClientError::TransportLost(e.to_string())),
                    }
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        // The relay fails whatever is still in flight once it sees the drop
        tasks.abort_all();
        result
    }
}

fn binary(frame: Bytes) -> Message {
    Message::Binary(frame.to_vec())
}

/// Encode an outbound frame; a response too large to tunnel is replaced by a 502
fn encode_outbound(msg: ControlMessage) -> Result<Bytes, CodecError> {
    match ControlCodec::encode(&msg) {
        Ok(frame) => Ok(frame),
        Err(CodecError::MessageTooLarge(size)) => match msg {
            ControlMessage::Response { id, .. } => {
                warn!("Response to {} is too large to tunnel ({} bytes)", id, size);
                ControlCodec::encode(&ControlMessage::Response {
                    id,
                    response: HttpResponse::synthesized(
                        502,
                        format!("Response too large to tunnel ({} bytes)", size),
                    ),
                })
            }
            _ => Err(CodecError::MessageTooLarge(size)),
        },
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::ServiceError;
    use async_trait::async_trait;
    use burrow_proto::{HttpRequest, RequestId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct Echo;

    #[async_trait]
    impl LocalService for Echo {
        async fn call(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError> {
            Ok(HttpResponse::new(200).with_body(request.path))
        }
    }

    fn test_config(port: u16) -> AgentConfig {
        AgentConfig {
            relay_url: format!("ws://127.0.0.1:{}", port),
            credential: "test-credential".to_string(),
            keepalive_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    async fn recv(ws: &mut WebSocketStream<TcpStream>) -> ControlMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return ControlCodec::decode(&data).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected frame, got {:?}", other),
            }
        }
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, msg: ControlMessage) {
        ws.send(binary(ControlCodec::encode(&msg).unwrap()))
            .await
            .unwrap();
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_and_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let controller = Arc::new(ConnectionController::new(test_config(port), Arc::new(Echo)));
        let mut states = controller.subscribe();
        let shutdown = CancellationToken::new();

        let runner = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run(shutdown).await })
        };

        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(socket).await.unwrap();

        match recv(&mut ws).await {
            ControlMessage::Connect {
                credential,
                protocol_version,
                ..
            } => {
                assert_eq!(credential, "test-credential");
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("Expected connect, got {:?}", other),
        }
        send(
            &mut ws,
            ControlMessage::Connected {
                agent_id: "agent-1".to_string(),
            },
        )
        .await;
        wait_for_state(&mut states, ConnectionState::Connected).await;

        let id = RequestId::random();
        send(
            &mut ws,
            ControlMessage::Request {
                id,
                request: HttpRequest::new("GET", "/hello"),
            },
        )
        .await;

        // Keepalives may interleave with the response
        loop {
            match recv(&mut ws).await {
                ControlMessage::Response {
                    id: got,
                    response,
                } => {
                    assert_eq!(got, id);
                    assert_eq!(response.body, b"/hello");
                    break;
                }
                ControlMessage::Keepalive { timestamp } => {
                    send(&mut ws, ControlMessage::KeepaliveAck { timestamp }).await;
                }
                other => panic!("Unexpected {:?}", other),
            }
        }

        shutdown.cancel();

        loop {
            match recv(&mut ws).await {
                ControlMessage::Disconnect { reason } => {
                    assert_eq!(reason, "agent shutting down");
                    break;
                }
                ControlMessage::Keepalive { .. } => continue,
                other => panic!("Unexpected {:?}", other),
            }
        }

        runner.await.unwrap().unwrap();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_agent_keeps_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let controller = Arc::new(ConnectionController::new(test_config(port), Arc::new(Echo)));
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let relay = {
            let attempts = attempts.clone();
            tokio::spawn(async move {
                loop {
                    let (socket, _) = listener.accept().await.unwrap();
                    let mut ws = accept_async(socket).await.unwrap();
                    let _ = recv(&mut ws).await;
                    attempts.fetch_add(1, Ordering::SeqCst);
                    send(
                        &mut ws,
                        ControlMessage::Rejected {
                            reason: RejectReason::AuthFailure,
                            message: "bad token".to_string(),
                        },
                    )
                    .await;
                    let _ = ws.close(None).await;
                }
            })
        };

        let runner = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run(shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while attempts.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("agent stopped retrying");

        assert_ne!(controller.state(), ConnectionState::Connected);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        relay.abort();
    }

    #[tokio::test]
    async fn test_silent_relay_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let controller = Arc::new(ConnectionController::new(test_config(port), Arc::new(Echo)));
        let mut states = controller.subscribe();
        let shutdown = CancellationToken::new();

        let runner = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run(shutdown).await })
        };

        // First connection: accept, then never answer keepalives
        let (socket, _) = listener.accept().await.unwrap();
        let mut silent = accept_async(socket).await.unwrap();
        let _ = recv(&mut silent).await;
        send(
            &mut silent,
            ControlMessage::Connected {
                agent_id: "agent-1".to_string(),
            },
        )
        .await;
        wait_for_state(&mut states, ConnectionState::Connected).await;

        let drain = tokio::spawn(async move { while silent.next().await.is_some() {} });

        wait_for_state(&mut states, ConnectionState::Disconnected).await;

        // The agent comes back on its own
        let (socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("agent did not reconnect")
            .unwrap();
        let mut ws = accept_async(socket).await.unwrap();
        assert!(matches!(recv(&mut ws).await, ControlMessage::Connect { .. }));

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        drain.abort();
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let config = AgentConfig {
            relay_url: "ftp://nowhere".to_string(),
            ..Default::default()
        };
        let controller = ConnectionController::new(config, Arc::new(Echo));

        let result = controller.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_oversized_response_becomes_502() {
        let id = RequestId::random();
        let huge = ControlMessage::Response {
            id,
            response: HttpResponse::new(200).with_body(vec![0u8; burrow_proto::MAX_FRAME_SIZE + 1]),
        };

        let frame = encode_outbound(huge).unwrap();
        match ControlCodec::decode(&frame).unwrap() {
            ControlMessage::Response { id: got, response } => {
                assert_eq!(got, id);
                assert_eq!(response.status, 502);
            }
            other => panic!("Unexpected {:?}", other),
        }
    }
}
