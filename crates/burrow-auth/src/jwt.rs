//! JWT (JSON Web Token) agent credentials

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::{AgentIdentity, AuthError, CredentialVerifier};

/// Role tag every agent credential must carry
pub const AGENT_ROLE: &str = "agent";

/// Default issuer written into minted credentials
pub const DEFAULT_ISSUER: &str = "burrow-relay";

/// JWT claims for agent authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentClaims {
    /// Subject (agent identity)
    pub sub: String,
    /// Role tag, always `"agent"` for credentials the relay accepts
    pub role: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

impl AgentClaims {
    pub fn new(agent_id: String, issuer: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: agent_id,
            role: AGENT_ROLE.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn exp_formatted(&self) -> String {
        use chrono::{DateTime, Local};
        let dt = DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now);
        let local: DateTime<Local> = dt.into();
        local.format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }
}

/// JWT errors raised while minting credentials
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Secret must not be empty")]
    EmptySecret,
}

/// Verifies HMAC-SHA256 agent credentials
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for credentials signed with the given shared secret
    ///
    /// Validates the signature, the expiry and the role tag. The issuer is
    /// only checked when [`JwtVerifier::with_issuer`] is used.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Decode and check a credential, returning its claims
    pub fn validate(&self, token: &str) -> Result<AgentClaims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let token_data = decode::<AgentClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        let claims = token_data.claims;

        if claims.is_expired() {
            return Err(AuthError::TokenExpired);
        }

        if claims.role != AGENT_ROLE {
            return Err(AuthError::RoleMismatch {
                expected: AGENT_ROLE.to_string(),
                found: claims.role,
            });
        }

        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(claims)
    }
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<AgentIdentity, AuthError> {
        let claims = self.validate(credential)?;
        Ok(AgentIdentity::new(claims.sub))
    }
}

/// Mints agent credentials; used by the offline `token` tool and by tests
pub struct CredentialIssuer {
    encoding_key: EncodingKey,
    issuer: String,
}

impl CredentialIssuer {
    pub fn new(secret: &[u8]) -> Result<Self, JwtError> {
        if secret.is_empty() {
            return Err(JwtError::EmptySecret);
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            issuer: DEFAULT_ISSUER.to_string(),
        })
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Issue a credential for `agent_id`, valid for `validity`
    pub fn issue(&self, agent_id: &str, validity: Duration) -> Result<String, JwtError> {
        let claims = AgentClaims::new(agent_id.to_string(), self.issuer.clone(), validity);
        self.encode(&claims)
    }

    /// Encode arbitrary claims (lets tests mint expired or mis-scoped tokens)
    pub fn encode(&self, claims: &AgentClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        Ok(encode(&header, claims, &self.encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    fn issuer() -> CredentialIssuer {
        CredentialIssuer::new(TEST_SECRET).unwrap()
    }

    #[test]
    fn test_issue_and_validate() {
        let token = issuer().issue("agent-123", Duration::hours(1)).unwrap();

        let verifier = JwtVerifier::new(TEST_SECRET).with_issuer(DEFAULT_ISSUER);
        let claims = verifier.validate(&token).unwrap();

        assert_eq!(claims.sub, "agent-123");
        assert_eq!(claims.role, AGENT_ROLE);
        assert_eq!(claims.iss, DEFAULT_ISSUER);
    }

    #[tokio::test]
    async fn test_verify_returns_identity() {
        let token = issuer().issue("office-nas", Duration::hours(1)).unwrap();

        let identity = JwtVerifier::new(TEST_SECRET).verify(&token).await.unwrap();
        assert_eq!(identity, AgentIdentity::new("office-nas"));
    }

    #[test]
    fn test_missing_credential() {
        let verifier = JwtVerifier::new(TEST_SECRET);
        assert!(matches!(
            verifier.validate(""),
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            verifier.validate("   "),
            Err(AuthError::MissingCredential)
        ));
    }

    #[test]
    fn test_wrong_secret() {
        let token = issuer().issue("agent-1", Duration::hours(1)).unwrap();

        let verifier = JwtVerifier::new(b"some_other_secret");
        assert!(matches!(
            verifier.validate(&token),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_expired_token() {
        let claims = AgentClaims::new(
            "agent-1".to_string(),
            DEFAULT_ISSUER.to_string(),
            Duration::minutes(-10), // Already expired, beyond the default leeway
        );
        assert!(claims.is_expired());

        let token = issuer().encode(&claims).unwrap();
        let result = JwtVerifier::new(TEST_SECRET).validate(&token);

        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_role_mismatch() {
        let claims = AgentClaims::new(
            "agent-1".to_string(),
            DEFAULT_ISSUER.to_string(),
            Duration::hours(1),
        )
        .with_role("client");

        let token = issuer().encode(&claims).unwrap();
        let result = JwtVerifier::new(TEST_SECRET).validate(&token);

        match result {
            Err(AuthError::RoleMismatch { expected, found }) => {
                assert_eq!(expected, "agent");
                assert_eq!(found, "client");
            }
            other => panic!("Expected RoleMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_token() {
        let result = JwtVerifier::new(TEST_SECRET).validate("not-a-jwt");
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_issuer_mismatch() {
        let token = issuer()
            .with_issuer("someone-else")
            .issue("agent-1", Duration::hours(1))
            .unwrap();

        let verifier = JwtVerifier::new(TEST_SECRET).with_issuer(DEFAULT_ISSUER);
        assert!(matches!(
            verifier.validate(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            CredentialIssuer::new(b""),
            Err(JwtError::EmptySecret)
        ));
    }
}
