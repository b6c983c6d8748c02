//! Executes tunneled requests against the private service
//!
//! Every request produces exactly one response: either what the service
//! answered, or a synthesized error (502 when the service can't be reached or
//! misbehaves, 504 when it is too slow).

use async_trait::async_trait;
use burrow_proto::{end_to_end, ControlMessage, HttpRequest, HttpResponse, RequestId};
use reqwest::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure to obtain an answer from the local service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Local service at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Local service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Local service request failed: {0}")]
    Other(String),
}

impl ServiceError {
    /// Status of the response synthesized for this failure
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::Timeout(_) => 504,
            ServiceError::Unreachable { .. } | ServiceError::Other(_) => 502,
        }
    }

    pub fn into_response(self) -> HttpResponse {
        HttpResponse::synthesized(self.status(), self.to_string())
    }
}

/// The private service the agent fronts
#[async_trait]
pub trait LocalService: Send + Sync {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError>;
}

/// Local service reached over plain HTTP
pub struct HttpLocalService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLocalService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        // Redirects are the public client's business, not ours
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ServiceError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn classify(&self, err: reqwest::Error) -> ServiceError {
        if err.is_connect() {
            ServiceError::Unreachable {
                address: self.base_url.clone(),
                reason: err.to_string(),
            }
        } else {
            ServiceError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl LocalService for HttpLocalService {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ServiceError::Other(format!("Invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, self.url_for(&request.path));
        for (name, value) in end_to_end(request.headers) {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Dropping invalid request header '{}'", name),
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let headers = end_to_end(
            response
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec())),
        );
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Turns incoming `Request` frames into `Response` frames
#[derive(Clone)]
pub struct RequestForwarder {
    service: Arc<dyn LocalService>,
    timeout: Duration,
}

impl RequestForwarder {
    pub fn new(service: Arc<dyn LocalService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// Execute one request; always yields a `Response` carrying the same id
    pub async fn handle(&self, id: RequestId, request: HttpRequest) -> ControlMessage {
        debug!("Forwarding request {}: {} {}", id, request.method, request.path);

        let result = match tokio::time::timeout(self.timeout, self.service.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.timeout)),
        };

        let response = match result {
            Ok(response) => {
                debug!("Request {} answered with {}", id, response.status);
                response
            }
            Err(e) => {
                warn!("Request {} failed locally: {}", id, e);
                e.into_response()
            }
        };

        ControlMessage::Response { id, response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Fixed(u16);

    #[async_trait]
    impl LocalService for Fixed {
        async fn call(&self, _request: HttpRequest) -> Result<HttpResponse, ServiceError> {
            Ok(HttpResponse::new(self.0).with_body("ok"))
        }
    }

    struct Slow;

    #[async_trait]
    impl LocalService for Slow {
        async fn call(&self, _request: HttpRequest) -> Result<HttpResponse, ServiceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(HttpResponse::new(200))
        }
    }

    fn response_of(msg: ControlMessage) -> (RequestId, HttpResponse) {
        match msg {
            ControlMessage::Response { id, response } => (id, response),
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passes_service_response_through() {
        let forwarder = RequestForwarder::new(Arc::new(Fixed(201)), Duration::from_secs(5));
        let id = RequestId::random();

        let (got_id, response) = response_of(forwarder.handle(id, HttpRequest::new("GET", "/")).await);

        assert_eq!(got_id, id);
        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"ok");
        assert!(response.header("x-burrow-error").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_service_yields_504() {
        let forwarder = RequestForwarder::new(Arc::new(Slow), Duration::from_secs(30));
        let id = RequestId::random();

        let (got_id, response) = response_of(forwarder.handle(id, HttpRequest::new("GET", "/")).await);

        assert_eq!(got_id, id);
        assert_eq!(response.status, 504);
        assert_eq!(response.header("x-burrow-error"), Some(&b"true"[..]));
    }

    #[tokio::test]
    async fn test_unreachable_service_yields_502() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let service = HttpLocalService::new(format!("http://127.0.0.1:{}", port)).unwrap();
        let forwarder = RequestForwarder::new(Arc::new(service), Duration::from_secs(5));

        let (_, response) =
            response_of(forwarder.handle(RequestId::random(), HttpRequest::new("GET", "/")).await);

        assert_eq!(response.status, 502);
        assert_eq!(response.header("x-burrow-error"), Some(&b"true"[..]));
        assert!(String::from_utf8_lossy(&response.body).contains("unreachable"));
    }

    #[tokio::test]
    async fn test_http_service_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let raw = String::from_utf8_lossy(&buf[..n]).to_string();

            let reply = "HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nX-Custom: yes\r\nContent-Length: 5\r\nConnection: close\r\n\r\nmoved";
            socket.write_all(reply.as_bytes()).await.unwrap();
            raw
        });

        let service = HttpLocalService::new(format!("http://{}/", addr)).unwrap();
        let request = HttpRequest::new("POST", "/submit?x=1")
            .with_header("X-Trace", "abc")
            .with_header("Connection", "keep-alive")
            .with_body("payload");

        let response = service.call(request).await.unwrap();
        let raw = server.await.unwrap();

        assert!(raw.starts_with("POST /submit?x=1 HTTP/1.1"));
        assert!(raw.to_ascii_lowercase().contains("x-trace: abc"));

        // Redirect is returned, not followed
        assert_eq!(response.status, 302);
        assert_eq!(response.header("location"), Some(&b"/elsewhere"[..]));
        assert_eq!(response.header("x-custom"), Some(&b"yes"[..]));
        assert!(response.header("content-length").is_none());
        assert!(response.header("connection").is_none());
        assert_eq!(response.body, b"moved");
    }

    #[tokio::test]
    async fn test_non_utf8_header_values_survive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();

            let mut reply = b"HTTP/1.1 200 OK\r\nX-Name: caf\xe9\r\n".to_vec();
            reply.extend_from_slice(b"Content-Length: 0\r\nConnection: close\r\n\r\n");
            socket.write_all(&reply).await.unwrap();
            buf.truncate(n);
            buf
        });

        let service = HttpLocalService::new(format!("http://{}", addr)).unwrap();
        let request = HttpRequest::new("GET", "/").with_header("X-Label", b"na\xefve".to_vec());

        let response = service.call(request).await.unwrap();
        let raw = server.await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("x-name"), Some(&b"caf\xe9"[..]));
        assert!(raw
            .windows(b"na\xefve".len())
            .any(|w| w == b"na\xefve"));
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(ServiceError::Timeout(Duration::from_secs(1)).status(), 504);
        assert_eq!(
            ServiceError::Unreachable {
                address: "x".into(),
                reason: "y".into()
            }
            .status(),
            502
        );
        assert_eq!(ServiceError::Other("z".into()).status(), 502);
    }
}
