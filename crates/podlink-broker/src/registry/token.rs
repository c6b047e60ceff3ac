//! Signed session tokens
//!
//! HS256 JWTs carrying the session id and subject. The signature and `exp`
//! are checked here; whether the session still exists is the registry's
//! call.

use std::fmt;

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use podlink_common::random::random_token;
use podlink_common::SessionId;

use super::RegistryError;

/// Minimum signing secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Claims carried by a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Session id
    pub sid: String,
    /// User subject
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Unique per issuance, so two tokens for one session never collide
    pub jti: String,
}

/// Issues and verifies session tokens
#[derive(Clone)]
pub struct SessionTokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl SessionTokenSigner {
    /// Create a signer from a shared secret
    pub fn new(secret: &[u8]) -> Result<Self, RegistryError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(RegistryError::Internal(format!(
                "session secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Sign a token for `session` valid until `expires_at`
    pub fn issue(
        &self,
        session: &SessionId,
        subject: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, RegistryError> {
        let claims = SessionClaims {
            sid: session.to_string(),
            sub: subject.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: random_token(16).map_err(|e| RegistryError::Internal(e.to_string()))?,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| RegistryError::Internal(format!("failed to sign session token: {}", e)))
    }

    /// Check signature and expiry, returning the claims
    pub fn verify(&self, token: &str) -> Result<SessionClaims, RegistryError> {
        decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| RegistryError::InvalidToken(e.to_string()))
    }
}

impl fmt::Debug for SessionTokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenSigner").finish_non_exhaustive()
    }
}

/// Index key for a token. Only the digest is kept in memory.
pub(crate) fn fingerprint(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, token.as_bytes()).as_ref())
}
