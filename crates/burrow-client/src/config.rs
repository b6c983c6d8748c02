//! Agent configuration

use std::time::Duration;
use url::Url;

use crate::controller::ClientError;

/// Configuration for the agent side of the tunnel
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay address, e.g. `ws://relay.example.com:8080`. The control path is
    /// appended when the URL has none.
    pub relay_url: String,

    /// Bearer credential presented in the handshake
    pub credential: String,

    /// Host of the private service requests are forwarded to
    pub local_host: String,

    /// Port of the private service requests are forwarded to
    pub local_port: u16,

    /// How often a keepalive is sent while connected
    pub keepalive_interval: Duration,

    /// Silence from the relay longer than this counts as a lost transport
    pub liveness_timeout: Duration,

    /// Upper bound for one call against the local service
    pub request_timeout: Duration,

    /// Fixed delay between reconnection attempts
    pub reconnect_interval: Duration,

    /// Upper bound for the WebSocket connect and the handshake reply
    pub connect_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080".to_string(),
            credential: String::new(),
            local_host: "127.0.0.1".to_string(),
            local_port: 3000,
            keepalive_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration and resolve the control connection URL
    pub fn control_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.relay_url).map_err(|e| {
            ClientError::InvalidConfig(format!("Invalid relay URL '{}': {}", self.relay_url, e))
        })?;

        match url.scheme() {
            "ws" | "wss" => {}
            "http" => set_scheme(&mut url, "ws")?,
            "https" => set_scheme(&mut url, "wss")?,
            other => {
                return Err(ClientError::InvalidConfig(format!(
                    "Unsupported relay URL scheme '{}' (expected ws, wss, http or https)",
                    other
                )))
            }
        }

        if url.path().is_empty() || url.path() == "/" {
            url.set_path(burrow_proto::CONTROL_PATH);
        }

        if self.keepalive_interval.is_zero() || self.reconnect_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "Keepalive and reconnect intervals must be non-zero".to_string(),
            ));
        }

        if self.liveness_timeout <= self.keepalive_interval {
            return Err(ClientError::InvalidConfig(format!(
                "Liveness timeout ({:?}) must exceed the keepalive interval ({:?})",
                self.liveness_timeout, self.keepalive_interval
            )));
        }

        Ok(url)
    }

    /// Base URL of the private service
    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<(), ClientError> {
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidConfig(format!("Cannot use scheme '{}'", scheme)))
}
