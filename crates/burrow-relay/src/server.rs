//! Relay HTTP server
//!
//! A single listener serves three things: the agent control endpoint, a
//! health endpoint, and every other request, which is tunneled to the
//! attached agent.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use burrow_auth::{CredentialVerifier, JwtVerifier};
use burrow_control::{RequestCorrelator, SessionRegistry, SubmitError};
use burrow_proto::{end_to_end, HttpRequest, HttpResponse, CONTROL_PATH, HEALTH_PATH};
use http_body_util::LengthLimitError;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, MAX_BODY_LIMIT};
use crate::control;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("JWT secret must not be empty")]
    MissingSecret,

    #[error("Body limit of {limit} bytes exceeds the maximum of {max} bytes")]
    BodyLimitTooLarge { limit: usize, max: usize },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// State shared by every handler
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub correlator: Arc<RequestCorrelator>,
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Cancelled when the server stops; control connections say goodbye
    pub shutdown: CancellationToken,
}

/// Health endpoint payload
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agent_attached: bool,
    pub agent_id: Option<String>,
    pub pending_requests: usize,
}

/// The relay: session registry, correlator and HTTP surface
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Create a relay verifying agent credentials as HS256 JWTs
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        if config.jwt_secret.is_empty() {
            return Err(RelayError::MissingSecret);
        }

        let mut verifier = JwtVerifier::new(config.jwt_secret.as_bytes());
        if let Some(issuer) = &config.jwt_issuer {
            verifier = verifier.with_issuer(issuer);
        }

        Self::with_verifier(config, Arc::new(verifier))
    }

    /// Create a relay with a custom credential verifier
    pub fn with_verifier(
        config: RelayConfig,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Self, RelayError> {
        if config.max_body_bytes > MAX_BODY_LIMIT {
            return Err(RelayError::BodyLimitTooLarge {
                limit: config.max_body_bytes,
                max: MAX_BODY_LIMIT,
            });
        }

        let registry = Arc::new(SessionRegistry::new());
        let correlator = Arc::new(RequestCorrelator::new(registry.clone()));

        Ok(Self {
            state: Arc::new(RelayState {
                config,
                registry,
                correlator,
                verifier,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route(CONTROL_PATH, get(control::handle_upgrade))
            .route(HEALTH_PATH, get(health))
            .fallback(tunnel_request)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let addr = self.state.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        let router = self.build_router();
        let local_addr = listener.local_addr()?;

        info!("🚀 Relay listening on {}", local_addr);
        info!("Agents connect to ws://{}{}", local_addr, CONTROL_PATH);

        let state = self.state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Shutting down relay");
                state.shutdown.cancel();
            })
            .await?;

        Ok(())
    }
}

/// `GET /_burrow/health`
async fn health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    let session = state.registry.current_session();

    Json(HealthResponse {
        status: "ok",
        agent_attached: session.is_some(),
        agent_id: session.map(|s| s.identity.to_string()),
        pending_requests: state.correlator.pending_count(),
    })
}

/// Fallback: tunnel the request to the attached agent
async fn tunnel_request(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) if exceeds_length_limit(&e) => {
            debug!("Rejecting request body: {}", e);
            return into_response(HttpResponse::synthesized(
                StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                "Request body too large",
            ));
        }
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return into_response(HttpResponse::synthesized(
                StatusCode::BAD_REQUEST.as_u16(),
                "Failed to read request body",
            ));
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let headers = end_to_end(
        parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec())),
    );

    let request = HttpRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body: (!body.is_empty()).then(|| body.to_vec()),
    };

    let method = request.method.clone();
    let path = request.path.clone();

    match state
        .correlator
        .submit(request, state.config.request_timeout)
        .await
    {
        Ok(response) => into_response(response),
        Err(SubmitError::NoSession) => {
            debug!("{} {} -> 503 (no agent attached)", method, path);
            into_response(HttpResponse::synthesized(
                StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                "No agent is connected",
            ))
        }
        Err(e @ SubmitError::TimedOut(_)) => {
            warn!("{} {} -> 504: {}", method, path, e);
            into_response(HttpResponse::synthesized(
                StatusCode::GATEWAY_TIMEOUT.as_u16(),
                e.to_string(),
            ))
        }
        Err(e @ SubmitError::Failed(_)) => {
            warn!("{} {} -> 502: {}", method, path, e);
            into_response(HttpResponse::synthesized(
                StatusCode::BAD_GATEWAY.as_u16(),
                e.to_string(),
            ))
        }
    }
}

fn exceeds_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Convert a tunneled response into an axum response
fn into_response(response: HttpResponse) -> Response {
    let Ok(status) = StatusCode::from_u16(response.status) else {
        warn!("Agent returned invalid status {}", response.status);
        return (StatusCode::BAD_GATEWAY, "Agent returned an invalid status").into_response();
    };

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in end_to_end(response.headers) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("Dropping invalid response header '{}'", name),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_response_preserves_headers_and_body() {
        let response = into_response(
            HttpResponse::new(201)
                .with_header("content-type", "application/json")
                .with_header("set-cookie", "a=1")
                .with_header("set-cookie", "b=2")
                .with_header("transfer-encoding", "chunked")
                .with_body(r#"{"ok":true}"#),
        );

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_into_response_rejects_invalid_status() {
        let response = into_response(HttpResponse::new(42));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_new_requires_secret() {
        assert!(matches!(
            RelayServer::new(RelayConfig::default()),
            Err(RelayError::MissingSecret)
        ));
    }

    #[test]
    fn test_into_response_keeps_non_utf8_header_bytes() {
        let response =
            into_response(HttpResponse::new(200).with_header("x-name", b"caf\xe9".to_vec()));
        assert_eq!(
            response.headers().get("x-name").unwrap().as_bytes(),
            b"caf\xe9"
        );
    }

    #[test]
    fn test_body_limit_must_fit_a_frame() {
        let config = RelayConfig {
            jwt_secret: "secret".to_string(),
            max_body_bytes: 20 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(
            RelayServer::new(config),
            Err(RelayError::BodyLimitTooLarge { .. })
        ));

        let config = RelayConfig {
            jwt_secret: "secret".to_string(),
            max_body_bytes: MAX_BODY_LIMIT,
            ..Default::default()
        };
        assert!(RelayServer::new(config).is_ok());
    }

    fn small_body_state() -> Arc<RelayState> {
        let config = RelayConfig {
            jwt_secret: "secret".to_string(),
            max_body_bytes: 8,
            ..Default::default()
        };
        RelayServer::new(config).unwrap().state().clone()
    }

    #[tokio::test]
    async fn test_oversized_body_yields_413() {
        let request = axum::http::Request::post("/upload")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();

        let response = tunnel_request(State(small_body_state()), request).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_broken_body_yields_400() {
        let chunks: Vec<Result<axum::body::Bytes, std::io::Error>> = vec![
            Ok(axum::body::Bytes::from_static(b"ab")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ];
        let request = axum::http::Request::post("/upload")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let response = tunnel_request(State(small_body_state()), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-burrow-error"], "true");
    }

    #[tokio::test]
    async fn test_body_is_preserved() {
        let response = into_response(HttpResponse::new(200).with_body(vec![0u8, 159, 146, 150]));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &[0u8, 159, 146, 150]);
    }
}
