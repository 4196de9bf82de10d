//! Connection identity.
//!
//! A connection proves who it is once, with a bearer token on its first
//! `joinProject`. From then on every event on that socket is attributed to
//! the verified user; identity fields inside client payloads are ignored.

use codecollab_core::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default lifetime of tokens minted by [`JwtVerifier::issue`].
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Token rejected: {0}")]
    InvalidToken(String),
    #[error("Invalid user id in token: {0}")]
    InvalidSubject(String),
    #[error("Token issuance failed: {0}")]
    Issue(String),
}

/// Resolves a bearer token to a user id.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// JWT claims. `sub` is the user UUID.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Expiration time (Unix seconds)
    pub exp: u64,
    /// Issued at time (Unix seconds)
    pub iat: u64,
}

/// HS256 JWT verifier over a shared secret.
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::default(),
        }
    }

    /// Mint a token for `user_id` valid for [`DEFAULT_TOKEN_TTL`].
    pub fn issue(&self, user_id: UserId) -> Result<String, AuthError> {
        self.issue_with_ttl(user_id, DEFAULT_TOKEN_TTL)
    }

    pub fn issue_with_ttl(&self, user_id: UserId, ttl: Duration) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + ttl.as_secs(),
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        uuid::Uuid::parse_str(&data.claims.sub)
            .map(UserId)
            .map_err(|e| AuthError::InvalidSubject(e.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
