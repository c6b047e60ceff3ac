//! Core data model shared by the identity, cluster and broker crates

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::random::random_token;

/// Number of random bytes behind a session id (192 bits)
const SESSION_ID_BYTES: usize = 24;

/// Proof of a validated user identity
///
/// Produced once per session creation from the identity provider's user-info
/// response and never persisted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IdentityProof {
    /// Stable subject used to locate the user's workload (email, else name)
    pub subject: String,
    /// Email claim, when the provider released it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name claim, when the provider released it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw user-info document as returned by the provider
    #[serde(default)]
    pub assertion: serde_json::Value,
}

/// Tokens issued by the identity provider
///
/// Owned by the client; the broker only brokers their creation.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    /// Bearer access token
    pub access_token: String,
    /// Refresh token, absent when the provider did not issue one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Token kind, normally `Bearer`
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// OpenID Connect id token, when requested via the `openid` scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Liveness of a user's workload as reported by the orchestration collaborator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum WorkloadStatus {
    /// Ready to accept exec and port-forward traffic
    Running,
    /// Starting, or not yet reported ready
    Pending,
    /// Not running
    Stopped,
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadStatus::Running => "Running",
            WorkloadStatus::Pending => "Pending",
            WorkloadStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Where a user's workload runs
///
/// A read-only snapshot taken during one session-creation call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadLocation {
    /// Workload (pod) name
    pub name: String,
    /// Namespace the workload runs in
    pub namespace: String,
    /// Liveness at the time of the snapshot
    pub status: WorkloadStatus,
}

impl WorkloadLocation {
    /// Whether the workload can receive traffic
    pub fn is_running(&self) -> bool {
        self.status == WorkloadStatus::Running
    }
}

/// Names of the cluster objects that make up one scoped credential
///
/// This is the handle teardown operates on. It is recorded at mint time and
/// never reconstructed from other identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrincipalHandle {
    /// Namespace the principal lives in
    pub namespace: String,
    /// Principal (service account) name
    pub principal: String,
    /// Permission binding name
    pub binding: String,
}

/// A cluster bearer token bound to exactly one workload
///
/// Not `Clone`: exactly one owner holds it, and its principal must be
/// revoked when that owner goes away.
pub struct ScopedCredential {
    handle: PrincipalHandle,
    token: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

impl ScopedCredential {
    /// Assemble a credential from its minted parts
    pub fn new(handle: PrincipalHandle, token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            handle,
            token: Zeroizing::new(token),
            expires_at,
        }
    }

    /// Cluster objects backing this credential
    pub fn handle(&self) -> &PrincipalHandle {
        &self.handle
    }

    /// Bearer token to present to the cluster API
    pub fn bearer_token(&self) -> &str {
        &self.token
    }

    /// When the bearer token stops being accepted by the cluster
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredential")
            .field("handle", &self.handle)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Opaque, unguessable session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Draw a fresh identifier from the system CSPRNG
    pub fn generate() -> Result<Self> {
        Ok(Self(random_token(SESSION_ID_BYTES)?))
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_opaque() {
        let a = SessionId::generate().unwrap();
        let b = SessionId::generate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn credential_debug_redacts_token() {
        let cred = ScopedCredential::new(
            PrincipalHandle {
                namespace: "user-alice".into(),
                principal: "podlink-abc".into(),
                binding: "podlink-abc".into(),
            },
            "super-secret-bearer".into(),
            Utc::now(),
        );
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("super-secret-bearer"));
        assert!(debug.contains("podlink-abc"));
        assert_eq!(cred.bearer_token(), "super-secret-bearer");
    }

    #[test]
    fn token_set_debug_redacts_tokens() {
        let tokens = TokenSet {
            access_token: "at-123".into(),
            refresh_token: Some("rt-456".into()),
            expires_in: Some(900),
            token_type: "Bearer".into(),
            id_token: None,
        };
        let debug = format!("{:?}", tokens);
        assert!(!debug.contains("at-123"));
        assert!(!debug.contains("rt-456"));
    }

    #[test]
    fn token_set_defaults_token_type() {
        let tokens: TokenSet = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn workload_status_serializes_pascal_case() {
        let loc = WorkloadLocation {
            name: "nb-alice".into(),
            namespace: "user-alice".into(),
            status: WorkloadStatus::Running,
        };
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json["status"], "Running");
        assert!(loc.is_running());
    }
}
