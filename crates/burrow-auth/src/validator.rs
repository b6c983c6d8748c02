//! Credential verifier trait for pluggable agent authentication
//!
//! The relay only needs a function from an opaque bearer credential to an
//! agent identity. The JWT implementation lives in [`crate::jwt`]; tests and
//! embedders can provide their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Identity of an authenticated agent, taken from the credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity(String);

impl AgentIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authentication errors
///
/// Every variant is reported to the agent as an `AuthFailure` rejection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No credential presented")]
    MissingCredential,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    TokenExpired,

    #[error("Role mismatch: expected '{expected}', found '{found}'")]
    RoleMismatch { expected: String, found: String },
}

/// Credential verifier trait
///
/// Implementations must be free of side effects and must never log the
/// credential itself; use [`credential_fingerprint`] in diagnostics.
///
/// # Example: static token table
///
/// ```ignore
/// use burrow_auth::{async_trait, AgentIdentity, AuthError, CredentialVerifier};
///
/// struct StaticTokens(HashMap<String, String>); // token -> agent id
///
/// #[async_trait]
/// impl CredentialVerifier for StaticTokens {
///     async fn verify(&self, credential: &str) -> Result<AgentIdentity, AuthError> {
///         self.0
///             .get(credential)
///             .map(|id| AgentIdentity::new(id.clone()))
///             .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Validate a bearer credential and return the agent identity it carries
    async fn verify(&self, credential: &str) -> Result<AgentIdentity, AuthError>;
}

/// Bounded, non-reversible label for a credential, safe to put in logs
///
/// Returns the first 6 bytes of the SHA-256 digest in hex, or `"none"` for an
/// empty credential.
pub fn credential_fingerprint(credential: &str) -> String {
    if credential.is_empty() {
        return "none".to_string();
    }

    let digest = Sha256::digest(credential.as_bytes());
    digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_bounded_and_stable() {
        let token = "eyJhbGciOiJIUzI1NiJ9.secret-payload.signature";
        let fp = credential_fingerprint(token);

        assert_eq!(fp.len(), 12);
        assert_eq!(fp, credential_fingerprint(token));
        assert!(!token.contains(&fp));
    }

    #[test]
    fn test_fingerprint_differs_per_credential() {
        assert_ne!(credential_fingerprint("a"), credential_fingerprint("b"));
    }

    #[test]
    fn test_fingerprint_empty() {
        assert_eq!(credential_fingerprint(""), "none");
    }

    #[test]
    fn test_identity_display() {
        let identity = AgentIdentity::new("office-nas");
        assert_eq!(identity.to_string(), "office-nas");
        assert_eq!(identity.as_str(), "office-nas");
    }

    #[test]
    fn test_error_messages() {
        let err = AuthError::RoleMismatch {
            expected: "agent".to_string(),
            found: "admin".to_string(),
        };
        assert!(err.to_string().contains("expected 'agent'"));
        assert_eq!(AuthError::TokenExpired.to_string(), "Token expired");
    }
}
