//! Session registry
//!
//! Owns every live session and its scoped credential. The session map and
//! the token index sit behind one lock that is held only for map lookups
//! and mutations; minting and revocation run after it is released.
//!
//! A session ends exactly once. Whoever removes it from the map (explicit
//! delete, expiry sweep, tunnel close or shutdown) revokes its credential
//! and notifies the bound tunnel; every later attempt sees
//! [`RegistryError::SessionNotFound`].

mod sweep;
mod token;

pub use sweep::spawn_sweeper;
pub use token::{SessionClaims, SessionTokenSigner, MIN_SECRET_LEN};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use podlink_cluster::{ClusterCredentialIssuer, MintError};
use podlink_common::{IdentityProof, PrincipalHandle, ScopedCredential, SessionId, WorkloadLocation};

use token::fingerprint;

/// Session registry failures
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No live session with this id or token
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session is past its absolute expiry
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Session token failed signature or expiry checks
    #[error("invalid session token: {0}")]
    InvalidToken(String),

    /// The session already has a live tunnel
    #[error("session {0} already has an open tunnel")]
    TunnelAlreadyBound(String),

    /// The renewed identity does not belong to the session's user
    #[error("identity does not match session owner")]
    SubjectMismatch,

    /// Credential minting failed (already rolled back)
    #[error(transparent)]
    Mint(#[from] MintError),

    /// Local failure
    #[error("registry internal error: {0}")]
    Internal(String),
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Explicit delete request
    Deleted,
    /// Absolute expiry reached
    Expired,
    /// Its tunnel closed
    TunnelClosed,
    /// Broker shutting down
    Shutdown,
}

impl EndReason {
    /// Machine-readable reason sent to the client
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Deleted => "session_deleted",
            EndReason::Expired => "session_expired",
            EndReason::TunnelClosed => "tunnel_closed",
            EndReason::Shutdown => "server_shutdown",
        }
    }

    /// Human-readable explanation
    pub fn message(&self) -> &'static str {
        match self {
            EndReason::Deleted => "session was deleted",
            EndReason::Expired => "session expired",
            EndReason::TunnelClosed => "tunnel closed",
            EndReason::Shutdown => "broker is shutting down",
        }
    }
}

/// Snapshot of a live session
///
/// The workload never changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Opaque id
    pub id: SessionId,
    /// Identity subject that created the session
    pub subject: String,
    /// Orchestration username derived from the identity
    pub username: String,
    /// Workload the credential is bound to
    pub workload: WorkloadLocation,
    /// Cluster objects backing the credential
    pub principal: PrincipalHandle,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Absolute expiry, never later than the credential's
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is past its absolute expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A newly issued session token
pub struct IssuedToken {
    /// Signed token; shown to the client once
    pub token: Zeroizing<String>,
    /// When the token stops verifying
    pub expires_at: DateTime<Utc>,
}

/// Result of [`SessionRegistry::create`]
pub struct IssuedSession {
    /// The stored session
    pub session: Session,
    /// Its first session token
    pub token: IssuedToken,
}

/// Lifetimes applied to new sessions
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Absolute session lifetime
    pub session_ttl: Duration,
    /// Session token lifetime
    pub token_ttl: Duration,
}

struct Entry {
    session: Session,
    credential: Arc<ScopedCredential>,
    token_key: String,
    refresh_token: Option<Zeroizing<String>>,
    tunnel_bound: bool,
    ended: watch::Sender<Option<EndReason>>,
}

impl Entry {
    fn check_live(&self, now: DateTime<Utc>) -> Result<(), RegistryError> {
        if self.session.is_expired_at(now) {
            return Err(RegistryError::SessionExpired(self.session.id.to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Entry>,
    /// Token fingerprint to session id
    tokens: HashMap<String, SessionId>,
}

struct Inner {
    state: RwLock<State>,
    issuer: Arc<dyn ClusterCredentialIssuer>,
    signer: SessionTokenSigner,
    config: RegistryConfig,
}

/// Registry of live sessions
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

fn not_found(id: &SessionId) -> RegistryError {
    RegistryError::SessionNotFound(id.to_string())
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(
        issuer: Arc<dyn ClusterCredentialIssuer>,
        signer: SessionTokenSigner,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                issuer,
                signer,
                config,
            }),
        }
    }

    /// Number of live sessions, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.state.read().sessions.len()
    }

    /// Whether no sessions are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn token_expiry(&self, now: DateTime<Utc>, session_expires_at: DateTime<Utc>) -> DateTime<Utc> {
        (now + to_chrono(self.inner.config.token_ttl)).min(session_expires_at)
    }

    /// Mint a credential for `workload` and store a new session
    #[instrument(
        skip(self, identity, refresh_token, workload),
        fields(subject = %identity.subject, workload = %workload.name, namespace = %workload.namespace)
    )]
    pub async fn create(
        &self,
        identity: &IdentityProof,
        username: &str,
        workload: WorkloadLocation,
        refresh_token: Option<String>,
    ) -> Result<IssuedSession, RegistryError> {
        let id = SessionId::generate().map_err(|e| RegistryError::Internal(e.to_string()))?;

        let credential = Arc::new(self.inner.issuer.mint(&workload).await?);

        let now = Utc::now();
        let expires_at = (now + to_chrono(self.inner.config.session_ttl)).min(credential.expires_at());
        let token_expires_at = self.token_expiry(now, expires_at);

        let token = match self
            .inner
            .signer
            .issue(&id, &identity.subject, now, token_expires_at)
        {
            Ok(token) => Zeroizing::new(token),
            Err(e) => {
                self.inner.issuer.revoke(&credential).await;
                return Err(e);
            }
        };

        let session = Session {
            id: id.clone(),
            subject: identity.subject.clone(),
            username: username.to_string(),
            workload,
            principal: credential.handle().clone(),
            created_at: now,
            expires_at,
        };

        let inserted = {
            let mut state = self.inner.state.write();
            if state.sessions.contains_key(&id) {
                false
            } else {
                let token_key = fingerprint(&token);
                state.tokens.insert(token_key.clone(), id.clone());
                state.sessions.insert(
                    id.clone(),
                    Entry {
                        session: session.clone(),
                        credential: credential.clone(),
                        token_key,
                        refresh_token: refresh_token.map(Zeroizing::new),
                        tunnel_bound: false,
                        ended: watch::channel(None).0,
                    },
                );
                true
            }
        };

        if !inserted {
            self.inner.issuer.revoke(&credential).await;
            return Err(RegistryError::Internal("session id collision".into()));
        }

        info!(
            session_id = %id,
            principal = %session.principal.principal,
            %expires_at,
            "Created session"
        );

        Ok(IssuedSession {
            session,
            token: IssuedToken {
                token,
                expires_at: token_expires_at,
            },
        })
    }

    /// Look up a live session by id
    pub fn get(&self, id: &SessionId) -> Result<Session, RegistryError> {
        let state = self.inner.state.read();
        let entry = state.sessions.get(id).ok_or_else(|| not_found(id))?;
        entry.check_live(Utc::now())?;
        Ok(entry.session.clone())
    }

    /// Look up a live session by its current session token
    pub fn get_by_token(&self, token: &str) -> Result<Session, RegistryError> {
        let claims = self.inner.signer.verify(token)?;

        let state = self.inner.state.read();
        let id = state
            .tokens
            .get(&fingerprint(token))
            .filter(|id| id.as_str() == claims.sid)
            .ok_or_else(|| RegistryError::SessionNotFound(claims.sid.clone()))?;
        let entry = state.sessions.get(id).ok_or_else(|| not_found(id))?;
        entry.check_live(Utc::now())?;
        Ok(entry.session.clone())
    }

    /// Resolve `token` and require it to belong to session `id`
    pub fn authenticate(&self, id: &SessionId, token: &str) -> Result<Session, RegistryError> {
        let session = self.get_by_token(token)?;
        if &session.id != id {
            return Err(RegistryError::InvalidToken(
                "token does not belong to this session".into(),
            ));
        }
        Ok(session)
    }

    /// Delete a session and revoke its credential
    pub async fn delete(&self, id: &SessionId) -> Result<Session, RegistryError> {
        self.end(id, EndReason::Deleted).await
    }

    /// Remove the session, notify its tunnel and revoke its credential.
    /// Only the caller that removes the entry does the revoke.
    #[instrument(skip(self, id, reason), fields(session_id = %id, reason = reason.as_str()))]
    pub async fn end(&self, id: &SessionId, reason: EndReason) -> Result<Session, RegistryError> {
        let entry = {
            let mut state = self.inner.state.write();
            let entry = state.sessions.remove(id).ok_or_else(|| not_found(id))?;
            state.tokens.remove(&entry.token_key);
            entry
        };

        entry.ended.send_replace(Some(reason));
        self.inner.issuer.revoke(&entry.credential).await;

        info!(principal = %entry.session.principal.principal, "Ended session");
        Ok(entry.session)
    }

    /// End every session past its expiry; returns how many were ended
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// End every session expired as of `now`
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<SessionId> = self
            .inner
            .state
            .read()
            .sessions
            .values()
            .filter(|e| e.session.is_expired_at(now))
            .map(|e| e.session.id.clone())
            .collect();

        let mut swept = 0;
        for id in expired {
            // A concurrent delete may have won; that is fine
            if self.end(&id, EndReason::Expired).await.is_ok() {
                swept += 1;
            }
        }
        swept
    }

    /// End every session. Used at shutdown so no principal outlives the
    /// process.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.inner.state.read().sessions.keys().cloned().collect();
        let mut ended = 0;
        for id in ids {
            if self.end(&id, EndReason::Shutdown).await.is_ok() {
                ended += 1;
            }
        }
        ended
    }

    /// Refresh token stored for the session, if any
    pub fn refresh_token(&self, id: &SessionId) -> Result<Option<Zeroizing<String>>, RegistryError> {
        let state = self.inner.state.read();
        let entry = state.sessions.get(id).ok_or_else(|| not_found(id))?;
        entry.check_live(Utc::now())?;
        Ok(entry.refresh_token.clone())
    }

    /// Issue a fresh session token for a re-authenticated owner
    ///
    /// The previous token stops resolving. The session's expiry and
    /// credential are unchanged.
    #[instrument(skip(self, id, subject, new_refresh_token), fields(session_id = %id))]
    pub fn reissue_token(
        &self,
        id: &SessionId,
        subject: &str,
        new_refresh_token: Option<String>,
    ) -> Result<IssuedToken, RegistryError> {
        let now = Utc::now();
        let session_expires_at = {
            let state = self.inner.state.read();
            let entry = state.sessions.get(id).ok_or_else(|| not_found(id))?;
            entry.check_live(now)?;
            if entry.session.subject != subject {
                return Err(RegistryError::SubjectMismatch);
            }
            entry.session.expires_at
        };

        let expires_at = self.token_expiry(now, session_expires_at);
        let token = Zeroizing::new(self.inner.signer.issue(id, subject, now, expires_at)?);

        {
            let mut guard = self.inner.state.write();
            let State { sessions, tokens } = &mut *guard;
            let entry = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
            let new_key = fingerprint(&token);
            let old_key = std::mem::replace(&mut entry.token_key, new_key.clone());
            if let Some(refresh) = new_refresh_token {
                entry.refresh_token = Some(Zeroizing::new(refresh));
            }
            tokens.remove(&old_key);
            tokens.insert(new_key, id.clone());
        }

        debug!(%expires_at, "Reissued session token");
        Ok(IssuedToken { token, expires_at })
    }

    /// Claim the session's single tunnel slot
    pub fn bind_tunnel(&self, id: &SessionId) -> Result<TunnelLease, RegistryError> {
        let mut state = self.inner.state.write();
        let entry = state.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.check_live(Utc::now())?;
        if entry.tunnel_bound {
            return Err(RegistryError::TunnelAlreadyBound(id.to_string()));
        }
        entry.tunnel_bound = true;

        Ok(TunnelLease {
            registry: self.clone(),
            session: entry.session.clone(),
            credential: entry.credential.clone(),
            ended: entry.ended.subscribe(),
        })
    }

    fn release_tunnel(&self, id: &SessionId) {
        if let Some(entry) = self.inner.state.write().sessions.get_mut(id) {
            entry.tunnel_bound = false;
        }
    }
}

/// A session's tunnel slot; released on drop
pub struct TunnelLease {
    registry: SessionRegistry,
    session: Session,
    credential: Arc<ScopedCredential>,
    ended: watch::Receiver<Option<EndReason>>,
}

impl TunnelLease {
    /// Session the tunnel is bound to
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Credential the tunnel acts with
    pub fn credential(&self) -> &ScopedCredential {
        &self.credential
    }

    /// Resolves once the registry ends the session. Cancel-safe.
    pub async fn ended(&mut self) -> EndReason {
        loop {
            if let Some(reason) = *self.ended.borrow_and_update() {
                return reason;
            }
            if self.ended.changed().await.is_err() {
                return (*self.ended.borrow()).unwrap_or(EndReason::Deleted);
            }
        }
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        self.registry.release_tunnel(&self.session.id);
    }
}
