//! Broker server configuration

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::registry::{RegistryConfig, MIN_SECRET_LEN};

/// Floor on the bearer-token lifetime requested from the cluster
pub const MIN_CREDENTIAL_TTL: Duration = Duration::from_secs(600);

/// Ceiling on the session and credential lifetimes
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// PEM files for serving TLS
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// Certificate chain
    pub cert: PathBuf,
    /// Private key
    pub key: PathBuf,
}

/// Session lifetimes and the token signing secret
#[derive(Clone)]
pub struct SessionSettings {
    /// HS256 secret for session tokens
    pub secret: Zeroizing<Vec<u8>>,
    /// Absolute session lifetime
    pub session_ttl: Duration,
    /// Session token lifetime
    pub token_ttl: Duration,
    /// Bearer-token lifetime requested from the cluster
    pub credential_ttl: Duration,
    /// Period of the expiry sweep
    pub sweep_interval: Duration,
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("secret", &"<redacted>")
            .field("session_ttl", &self.session_ttl)
            .field("token_ttl", &self.token_ttl)
            .field("credential_ttl", &self.credential_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

/// Everything the HTTP server needs
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bind address
    pub listen_addr: SocketAddr,
    /// Base for tunnel URLs; derived from the Host header when unset
    pub public_url: Option<String>,
    /// Serve TLS when set
    pub tls: Option<TlsFiles>,
    /// Session lifetimes
    pub session: SessionSettings,
    /// Close a tunnel after this long without inbound frames
    pub tunnel_idle_timeout: Duration,
    /// How long in-flight requests get after a shutdown signal
    pub shutdown_grace: Duration,
}

impl BrokerConfig {
    /// Credential lifetime actually requested: at least ten minutes and
    /// never longer than the session
    pub fn credential_ttl(&self) -> Duration {
        let ttl = self.session.credential_ttl.min(self.session.session_ttl);
        ttl.max(MIN_CREDENTIAL_TTL)
    }

    /// Lifetimes for the session registry
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            session_ttl: self.session.session_ttl,
            token_ttl: self.session.token_ttl,
        }
    }

    /// Reject settings that would break the session invariants
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "session secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if session.session_ttl.is_zero() {
            return Err(Error::Config("session ttl must be positive".into()));
        }
        if session.session_ttl > MAX_TTL || session.credential_ttl > MAX_TTL {
            return Err(Error::Config(format!(
                "session and credential ttls must not exceed {}s",
                MAX_TTL.as_secs()
            )));
        }
        if session.token_ttl.is_zero() || session.token_ttl >= self.credential_ttl() {
            return Err(Error::Config(format!(
                "session token ttl ({}s) must be shorter than the credential ttl ({}s)",
                session.token_ttl.as_secs(),
                self.credential_ttl().as_secs()
            )));
        }
        if session.token_ttl > session.session_ttl {
            return Err(Error::Config(
                "session token ttl must not exceed the session ttl".into(),
            ));
        }
        if session.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be positive".into()));
        }
        if self.tunnel_idle_timeout.is_zero() {
            return Err(Error::Config("tunnel idle timeout must be positive".into()));
        }
        if let Some(url) = &self.public_url {
            if !["https://", "http://", "wss://", "ws://"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
            {
                return Err(Error::Config(format!("unsupported public url: {}", url)));
            }
        }
        Ok(())
    }
}
