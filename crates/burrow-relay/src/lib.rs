//! Burrow relay
//!
//! Accepts public HTTP requests and tunnels them to the single attached agent
//! over its WebSocket control connection.

pub mod config;
pub mod control;
pub mod server;

pub use config::{RelayConfig, MAX_BODY_LIMIT};
pub use server::{HealthResponse, RelayError, RelayServer, RelayState};
