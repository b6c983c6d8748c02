//! Burrow agent
//!
//! The agent keeps one outbound WebSocket connection open to the relay and
//! executes the HTTP requests it receives against a private local service.
//!
//! ```no_run
//! use burrow_client::{AgentConfig, ConnectionController, HttpLocalService};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig {
//!     relay_url: "wss://relay.example.com".to_string(),
//!     credential: std::env::var("BURROW_TOKEN")?,
//!     ..Default::default()
//! };
//! let service = HttpLocalService::new(config.local_base_url())?;
//! let controller = ConnectionController::new(config, Arc::new(service));
//!
//! controller.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod forwarder;
pub mod liveness;
pub mod reconnect;

pub use config::AgentConfig;
pub use controller::{ClientError, ConnectionController, ConnectionState};
pub use forwarder::{HttpLocalService, LocalService, RequestForwarder, ServiceError};
pub use liveness::KeepaliveMonitor;
pub use reconnect::ReconnectTimer;
