//! HTTP handlers for login and session management

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use podlink_common::{SessionId, TokenSet};

use crate::error::{Error, Result};
use crate::locator::{username_for, LocatorError};
use crate::registry::{IssuedToken, Session};
use crate::server::AppState;

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
    }))
}

/// Response of `GET /auth/start`
#[derive(Debug, Serialize)]
pub struct StartLoginResponse {
    /// Where the user's browser goes next
    pub auth_url: String,
    /// Opaque flow state to return on callback
    pub state: String,
}

/// `GET /auth/start`
#[instrument(skip(state))]
pub async fn start_login(State(state): State<AppState>) -> Result<Json<StartLoginResponse>> {
    let start = state.identity.start_login()?;
    info!("Login started");
    Ok(Json(StartLoginResponse {
        auth_url: start.authorization_url,
        state: start.flow_state,
    }))
}

/// Query of `GET /auth/callback`
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

/// `GET /auth/callback?code=..&state=..`
#[instrument(skip_all)]
pub async fn complete_login(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<TokenSet>> {
    let (Some(code), Some(flow_state)) = (
        query.code.filter(|c| !c.is_empty()),
        query.state.filter(|s| !s.is_empty()),
    ) else {
        return Err(Error::BadRequest("missing code or state parameter".into()));
    };

    let tokens = state.identity.complete_login(&code, &flow_state).await?;
    info!("Login completed");
    Ok(Json(tokens))
}

/// Body of `POST /auth/refresh`
#[derive(Debug, Deserialize)]
pub struct RefreshLoginRequest {
    #[serde(alias = "refreshToken")]
    refresh_token: String,
}

/// `POST /auth/refresh`
#[instrument(skip_all)]
pub async fn refresh_login(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RefreshLoginRequest>, JsonRejection>,
) -> Result<Json<TokenSet>> {
    let Json(request) = payload.map_err(|e| Error::BadRequest(e.body_text()))?;
    Ok(Json(state.identity.refresh(&request.refresh_token).await?))
}

/// Body of `POST /session`
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

/// A session as shown to its owner
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    /// Session id
    pub session_id: String,
    /// Orchestration username
    pub username: String,
    /// Workload namespace
    pub namespace: String,
    /// Workload name
    pub pod: String,
    /// Where to open the tunnel
    pub tunnel_url: String,
    /// Session token; only present when one was just issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// When the session token stops working
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token_expires_at: Option<DateTime<Utc>>,
    /// Absolute session expiry
    pub expires_at: DateTime<Utc>,
}

impl SessionResponse {
    fn new(session: &Session, tunnel_base: &str, token: Option<&IssuedToken>) -> Self {
        Self {
            session_id: session.id.to_string(),
            username: session.username.clone(),
            namespace: session.workload.namespace.clone(),
            pod: session.workload.name.clone(),
            tunnel_url: format!("{}/tunnel/{}", tunnel_base, session.id),
            session_token: token.map(|t| t.token.to_string()),
            session_token_expires_at: token.map(|t| t.expires_at),
            expires_at: session.expires_at,
        }
    }
}

/// WebSocket base URL for tunnels
///
/// The configured public URL with its scheme switched to `ws`/`wss`, else
/// `wss://` plus the request's Host header.
fn tunnel_base(public_url: Option<&str>, headers: &HeaderMap) -> Result<String> {
    if let Some(url) = public_url {
        let url = url.trim_end_matches('/');
        let base = if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            url.to_string()
        };
        return Ok(base);
    }

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::BadRequest("missing Host header".into()))?;
    Ok(format!("wss://{}", host))
}

/// `POST /session`
///
/// Validates the access token, makes sure the user's workload runs, mints a
/// credential scoped to it and returns the session with its first token.
#[instrument(skip_all)]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>> {
    let Json(request) = payload.map_err(|e| Error::BadRequest(e.body_text()))?;
    if request.access_token.is_empty() {
        return Err(Error::BadRequest("access_token is required".into()));
    }
    let base = tunnel_base(state.public_url.as_deref(), &headers)?;

    let identity = state.identity.validate_access(&request.access_token).await?;
    let username = username_for(&identity)
        .ok_or_else(|| Error::BadRequest("identity carries no usable username".into()))?;

    let workload = state.locator.ensure_running(&username).await?;
    if !workload.is_running() {
        return Err(LocatorError::WorkloadUnavailable(format!(
            "workload {} is {}",
            workload.name, workload.status
        ))
        .into());
    }

    let issued = state
        .registry
        .create(&identity, &username, workload, request.refresh_token)
        .await?;

    Ok(Json(SessionResponse::new(
        &issued.session,
        &base,
        Some(&issued.token),
    )))
}

/// `GET /session/{id}`
///
/// Never includes the session token; holding the id is not enough to
/// obtain one.
#[instrument(skip(state, headers))]
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>> {
    let session = state.registry.get(&SessionId::from(id))?;
    let base = tunnel_base(state.public_url.as_deref(), &headers)?;
    Ok(Json(SessionResponse::new(&session, &base, None)))
}

/// Query of `DELETE /session/{id}`
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default, rename = "stopWorkload", alias = "stop_workload")]
    stop_workload: bool,
}

/// `DELETE /session/{id}`
#[instrument(skip(state, query))]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>> {
    let session = state.registry.delete(&SessionId::from(id)).await?;

    if query.stop_workload {
        if let Err(e) = state.locator.stop(&session.username).await {
            warn!(username = %session.username, error = %e, "Failed to stop workload");
        }
    }

    Ok(Json(json!({ "message": "session deleted" })))
}

/// Body of `POST /session/{id}/refresh`
#[derive(Debug, Default, Deserialize)]
pub struct RenewRequest {
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

/// Response of `POST /session/{id}/refresh`: the session with its new
/// token plus the provider's refreshed tokens
#[derive(Debug, Serialize)]
pub struct RenewResponse {
    #[serde(flatten)]
    session: SessionResponse,
    #[serde(flatten)]
    tokens: TokenSet,
}

/// `POST /session/{id}/refresh`
///
/// The caller proves ownership either with a refresh token in the body or
/// with the session's current token as a bearer, in which case the refresh
/// token stored at creation is used. The refreshed identity must be the
/// session's owner.
#[instrument(skip(state, headers, payload))]
pub async fn renew_session_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<RenewRequest>>,
) -> Result<Json<RenewResponse>> {
    let id = SessionId::from(id);
    let presented = payload
        .and_then(|Json(body)| body.refresh_token)
        .filter(|t| !t.is_empty());

    let refresh_token = match presented {
        Some(token) => token,
        None => {
            let bearer = headers
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer "))
                .ok_or_else(|| Error::Unauthorized("refresh token required".into()))?;
            state
                .registry
                .authenticate(&id, bearer)
                .map_err(|_| Error::Unauthorized("invalid session token".into()))?;
            state
                .registry
                .refresh_token(&id)?
                .map(|t| t.to_string())
                .ok_or_else(|| Error::BadRequest("session has no refresh token".into()))?
        }
    };

    let tokens = state.identity.refresh(&refresh_token).await?;
    let identity = state.identity.validate_access(&tokens.access_token).await?;
    let issued = state
        .registry
        .reissue_token(&id, &identity.subject, tokens.refresh_token.clone())?;
    let session = state.registry.get(&id)?;

    let base = tunnel_base(state.public_url.as_deref(), &headers)?;
    Ok(Json(RenewResponse {
        session: SessionResponse::new(&session, &base, Some(&issued)),
        tokens,
    }))
}
