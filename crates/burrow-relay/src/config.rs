//! Relay configuration

use burrow_proto::MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::time::Duration;

/// Largest allowed `max_body_bytes`; a request must still fit one control
/// frame together with its method, path and headers
pub const MAX_BODY_LIMIT: usize = MAX_FRAME_SIZE - 1024 * 1024;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address serving both public traffic and the agent control endpoint
    pub bind_addr: SocketAddr,

    /// Shared secret agent credentials are signed with
    pub jwt_secret: String,

    /// Expected `iss` claim; any issuer is accepted when unset
    pub jwt_issuer: Option<String>,

    /// How long a public caller waits for the agent's answer
    pub request_timeout: Duration,

    /// How long a new control connection may take to present its credential
    pub handshake_timeout: Duration,

    /// A control connection silent for longer than this is dropped
    pub idle_timeout: Duration,

    /// Largest public request body accepted for tunneling, at most
    /// [`MAX_BODY_LIMIT`]
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: String::new(),
            jwt_issuer: None,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}
