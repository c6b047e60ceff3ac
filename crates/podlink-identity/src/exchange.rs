//! Authorization-code exchange against the identity provider

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{OidcConfig, ProviderEndpoints};
use crate::error::{IdentityError, Result};
use crate::flow::{FlowState, CODE_CHALLENGE_METHOD};
use podlink_common::{IdentityProof, TokenSet};

/// Longest provider error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Result of starting a login
#[derive(Debug, Clone)]
pub struct LoginStart {
    /// URL the user's browser must visit
    pub authorization_url: String,
    /// Opaque state the client returns verbatim on completion
    pub flow_state: String,
}

/// The login exchange as seen by the broker's HTTP surface
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    /// Generate PKCE secrets and the authorization URL
    fn start_login(&self) -> Result<LoginStart>;

    /// Exchange an authorization code using the verifier inside `flow_state`
    async fn complete_login(&self, code: &str, flow_state: &str) -> Result<TokenSet>;

    /// Resolve an access token to the user it was issued to
    async fn validate_access(&self, access_token: &str) -> Result<IdentityProof>;

    /// Exchange a refresh token for a new token set
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet>;
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl From<TokenResponse> for TokenSet {
    fn from(r: TokenResponse) -> Self {
        TokenSet {
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            expires_in: r.expires_in,
            token_type: r.token_type.unwrap_or_else(|| "Bearer".to_string()),
            id_token: r.id_token,
        }
    }
}

/// OIDC provider client
pub struct OidcExchange {
    config: OidcConfig,
    endpoints: ProviderEndpoints,
    http: reqwest::Client,
}

impl OidcExchange {
    /// Create a client; every request it makes is bounded by `config.timeout`
    pub fn new(config: OidcConfig, endpoints: ProviderEndpoints) -> Result<Self> {
        config.validate()?;
        Url::parse(&endpoints.authorization).map_err(|e| {
            IdentityError::Config(format!(
                "invalid authorization endpoint {}: {}",
                endpoints.authorization, e
            ))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IdentityError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            endpoints,
            http,
        })
    }

    fn authorization_url(&self, flow: &FlowState) -> Result<String> {
        let mut url = Url::parse(&self.endpoints.authorization)
            .map_err(|e| IdentityError::Config(e.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_url)
                .append_pair("scope", &self.config.effective_scopes().join(" "))
                .append_pair("state", &flow.state)
                .append_pair("code_challenge", &flow.code_challenge())
                .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
            if let Some(idp) = &self.config.selected_idp {
                query.append_pair("selected_idp", idp);
            }
        }

        Ok(url.into())
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.endpoints.token)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| IdentityError::ProviderUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            warn!(status = %status, "Token endpoint rejected exchange");
            return Err(IdentityError::ProviderRejected {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::MalformedProviderResponse(e.to_string()))?;

        if tokens.access_token.is_empty() {
            return Err(IdentityError::MalformedProviderResponse(
                "empty access token".into(),
            ));
        }

        Ok(tokens.into())
    }
}

#[async_trait]
impl IdentityExchange for OidcExchange {
    fn start_login(&self) -> Result<LoginStart> {
        let flow = FlowState::generate()?;
        let authorization_url = self.authorization_url(&flow)?;
        let flow_state = flow.encode()?;

        debug!(state = %flow.state, "Started login flow");

        Ok(LoginStart {
            authorization_url,
            flow_state,
        })
    }

    async fn complete_login(&self, code: &str, flow_state: &str) -> Result<TokenSet> {
        let flow = FlowState::decode(flow_state)?;

        let tokens = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code_verifier", flow.code_verifier.as_str()),
            ])
            .await?;

        info!(state = %flow.state, "Completed login code exchange");
        Ok(tokens)
    }

    async fn validate_access(&self, access_token: &str) -> Result<IdentityProof> {
        let response = self
            .http
            .get(&self.endpoints.userinfo)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| IdentityError::ProviderUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = %status, "User-info endpoint rejected access token");
            return Err(IdentityError::TokenRejected {
                status: status.as_u16(),
            });
        }

        let assertion: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IdentityError::MalformedProviderResponse(e.to_string()))?;

        identity_from_userinfo(assertion)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        let mut tokens = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        // Providers that do not rotate refresh tokens omit the field.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }

        debug!("Refreshed access token");
        Ok(tokens)
    }
}

/// Map a user-info document to an identity proof
///
/// The subject is the email when present, else the name, else `sub`.
fn identity_from_userinfo(assertion: serde_json::Value) -> Result<IdentityProof> {
    let claim = |name: &str| {
        assertion
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let email = claim("email");
    let name = claim("name");
    let subject = email
        .clone()
        .or_else(|| name.clone())
        .or_else(|| claim("sub"))
        .ok_or_else(|| {
            IdentityError::MalformedProviderResponse(
                "user-info response has no email, name or sub".into(),
            )
        })?;

    Ok(IdentityProof {
        subject,
        email,
        name,
        assertion,
    })
}

async fn truncated_body(response: reqwest::Response) -> String {
    let status = response.status();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    if body.is_empty() {
        body = status.canonical_reason().unwrap_or("no body").to_string();
    }
    body
}
