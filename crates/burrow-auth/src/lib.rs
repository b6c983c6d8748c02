//! Agent credential verification and issuance

pub mod jwt;
pub mod validator;

pub use jwt::{AgentClaims, CredentialIssuer, JwtError, JwtVerifier, AGENT_ROLE, DEFAULT_ISSUER};
pub use validator::{credential_fingerprint, AgentIdentity, AuthError, CredentialVerifier};

// Re-export useful types
pub use async_trait::async_trait;
pub use chrono::Duration;
