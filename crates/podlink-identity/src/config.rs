//! Identity provider configuration

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{IdentityError, Result};

/// Default timeout for every identity provider call
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Scopes the broker always requests, whatever the configuration says
const REQUIRED_SCOPES: &[&str] = &["openid", "email", "profile"];

/// OIDC client configuration
#[derive(Clone)]
pub struct OidcConfig {
    /// Issuer base URL (e.g. `https://cilogon.org`)
    pub issuer: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: Zeroizing<String>,
    /// Redirect target registered with the provider
    pub redirect_url: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Optional provider hint forwarded as `selected_idp`
    pub selected_idp: Option<String>,
    /// Bound on every provider call
    pub timeout: Duration,
}

impl OidcConfig {
    /// Configured scopes plus the required ones, deduplicated, in a stable order
    pub fn effective_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect();
        for scope in &self.scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }

    /// Reject configurations that cannot complete a login
    pub fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() {
            return Err(IdentityError::Config("issuer is required".into()));
        }
        if self.client_id.is_empty() {
            return Err(IdentityError::Config("client id is required".into()));
        }
        if self.client_secret.is_empty() {
            return Err(IdentityError::Config("client secret is required".into()));
        }
        if self.redirect_url.is_empty() {
            return Err(IdentityError::Config("redirect URL is required".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcConfig")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .field("selected_idp", &self.selected_idp)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Provider endpoint URLs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// Browser authorization endpoint
    pub authorization: String,
    /// Code / refresh token exchange endpoint
    pub token: String,
    /// User-info endpoint
    pub userinfo: String,
}

/// Subset of the OIDC discovery document
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

impl ProviderEndpoints {
    /// CILogon-style layout rooted at the issuer
    pub fn from_issuer(issuer: &str) -> Self {
        let base = issuer.trim_end_matches('/');
        Self {
            authorization: format!("{}/authorize", base),
            token: format!("{}/oauth2/token", base),
            userinfo: format!("{}/oauth2/userinfo", base),
        }
    }

    /// Resolve endpoints from `/.well-known/openid-configuration`
    pub async fn discover(issuer: &str, timeout: Duration) -> Result<Self> {
        let base = issuer.trim_end_matches('/');
        let url = format!("{}/.well-known/openid-configuration", base);

        debug!(url = %url, "Fetching OIDC discovery document");

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Config(format!("failed to create HTTP client: {}", e)))?;

        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| IdentityError::ProviderUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IdentityError::Config(format!(
                "discovery returned {}",
                response.status()
            )));
        }

        let discovery: OidcDiscovery = response
            .json()
            .await
            .map_err(|e| IdentityError::MalformedProviderResponse(e.to_string()))?;

        if discovery.issuer.trim_end_matches('/') != base {
            return Err(IdentityError::Config(format!(
                "issuer mismatch: expected {}, got {}",
                base, discovery.issuer
            )));
        }

        info!(issuer = %base, "Resolved identity provider endpoints via discovery");

        Ok(Self {
            authorization: discovery.authorization_endpoint,
            token: discovery.token_endpoint,
            userinfo: discovery.userinfo_endpoint,
        })
    }
}
