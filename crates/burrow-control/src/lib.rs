//! Relay-side control plane: the single agent session and request correlation
pub mod connection;
pub mod pending_requests;
pub mod registry;

pub use connection::{ConnectionHandle, ConnectionId};
pub use pending_requests::{RequestCorrelator, SubmitError};
pub use registry::{AttachError, ForwardError, Session, SessionRegistry, SessionSnapshot};
