//! PKCE secrets and the opaque flow state
//!
//! The code verifier and anti-replay state are generated per login, embedded
//! in a base64url JSON blob handed to the client, and recovered from that
//! blob when the client completes the login.

use std::fmt;

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, Result};
use podlink_common::random::random_token;

/// PKCE challenge method; plain is never offered
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Verifier entropy. 64 bytes encode to 86 characters, inside the
/// 43..=128 range RFC 7636 allows.
const CODE_VERIFIER_BYTES: usize = 64;

/// Anti-replay state entropy
const STATE_BYTES: usize = 32;

/// Secrets for one login attempt
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// Anti-replay value sent as the OAuth `state` parameter
    pub state: String,
    /// PKCE code verifier
    pub code_verifier: String,
}

impl FlowState {
    /// Generate a fresh verifier and state
    pub fn generate() -> Result<Self> {
        Ok(Self {
            state: random_token(STATE_BYTES)?,
            code_verifier: random_token(CODE_VERIFIER_BYTES)?,
        })
    }

    /// S256 challenge for this flow's verifier
    pub fn code_challenge(&self) -> String {
        code_challenge(&self.code_verifier)
    }

    /// Opaque form handed to the client
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| IdentityError::Internal(format!("failed to encode flow state: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Recover the secrets from the client-returned opaque form
    pub fn decode(encoded: &str) -> Result<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| IdentityError::InvalidFlowState(format!("not base64url: {}", e)))?;

        let flow: FlowState = serde_json::from_slice(&json)
            .map_err(|e| IdentityError::InvalidFlowState(format!("not a flow state: {}", e)))?;

        if flow.code_verifier.is_empty() {
            return Err(IdentityError::InvalidFlowState(
                "missing code verifier".into(),
            ));
        }
        if flow.state.is_empty() {
            return Err(IdentityError::InvalidFlowState("missing state".into()));
        }

        Ok(flow)
    }
}

impl fmt::Debug for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowState")
            .field("state", &self.state)
            .field("code_verifier", &"<redacted>")
            .finish()
    }
}

/// base64url(SHA-256(verifier)), no padding
pub fn code_challenge(verifier: &str) -> String {
    let hash = digest(&SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}
