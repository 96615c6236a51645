//! Authentication
//!
//! Agents present either the shared API key or an HS256 token minted by the
//! server. Both are checked here; callers never need to know which kind an
//! agent used.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;

/// Claims carried by an agent token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Agent id the token was issued for
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential supplied")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("token expired")]
    Expired,

    #[error("token signing is not configured")]
    NotConfigured,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Expired => "TOKEN_EXPIRED",
            AuthError::NotConfigured | AuthError::Signing(_) => "AUTH_UNAVAILABLE",
            AuthError::MissingCredential | AuthError::InvalidCredential => "AUTH_FAILED",
        }
    }
}

/// How an agent proved itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey,
    Token,
}

/// Result of a successful check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub agent_id: String,
    pub method: AuthMethod,
}

/// Verifies agent credentials and mints tokens.
pub struct Authenticator {
    api_key: Option<String>,
    keys: Option<(EncodingKey, DecodingKey)>,
    token_ttl: Duration,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let keys = config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| {
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            });
        Self {
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            keys,
            token_ttl: Duration::from_secs(config.token_ttl_secs),
        }
    }

    /// Whether any credential is configured at all.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() || self.keys.is_some()
    }

    /// Check an agent credential.
    ///
    /// With the API key the agent keeps the id it asked for (or gets a
    /// fresh one); a token's subject always wins over the requested id.
    pub fn verify(&self, token: &str, requested_id: Option<&str>) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        if self.check_api_key(token) {
            let agent_id = requested_id
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            return Ok(Identity {
                agent_id,
                method: AuthMethod::ApiKey,
            });
        }

        let Some((_, decoding)) = &self.keys else {
            return Err(AuthError::InvalidCredential);
        };
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidCredential,
        })?;

        Ok(Identity {
            agent_id: data.claims.sub,
            method: AuthMethod::Token,
        })
    }

    /// Compare against the API key without an early exit on mismatch.
    pub fn check_api_key(&self, candidate: &str) -> bool {
        let Some(key) = &self.api_key else {
            return false;
        };
        let (a, b) = (key.as_bytes(), candidate.as_bytes());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    /// Sign a token for `agent_id`, valid for `ttl` or the configured lifetime.
    pub fn mint(&self, agent_id: &str, ttl: Option<Duration>) -> Result<String, AuthError> {
        let (encoding, _) = self.keys.as_ref().ok_or(AuthError::NotConfigured)?;
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: agent_id.to_string(),
            iat: now,
            exp: now + ttl.unwrap_or(self.token_ttl).as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}
