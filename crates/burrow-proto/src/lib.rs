//! Burrow Protocol Definitions
//!
//! This crate defines the messages exchanged between the relay and the agent
//! over the control connection, and the codec used to frame them.

pub mod codec;
pub mod headers;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use headers::{end_to_end, is_hop_by_hop};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Path of the WebSocket endpoint agents connect to
pub const CONTROL_PATH: &str = "/_burrow/connect";

/// Path of the relay health endpoint
pub const HEALTH_PATH: &str = "/_burrow/health";

/// Milliseconds since the Unix epoch, used for keepalive timestamps
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
