//! Tunnel multiplexer
//!
//! A tunnel is a WebSocket bound to exactly one session. The session token
//! is checked before the upgrade completes, so a caller holding a wrong,
//! expired or foreign token never gets a socket:
//!
//! ```text
//! GET /tunnel/{id}?token=..  ──► authenticate ──► claim tunnel slot
//!                            ──► connect with scoped credential ──► 101
//! ```
//!
//! Once bound, [`run_tunnel`] relays frames until the client leaves, the
//! tunnel idles out or the session ends. The session ends with its tunnel.

mod forward;
mod mux;
mod ops;

pub use mux::{run_tunnel, TunnelContext};

use axum::extract::{FromRequestParts, Path, Query, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, instrument};

use podlink_common::SessionId;

use crate::error::Error;
use crate::server::AppState;

/// Response for every token failure, whatever the cause
const INVALID_TOKEN: &str = "invalid session token";

/// Query string of a tunnel upgrade
#[derive(Debug, Default, Deserialize)]
pub struct TunnelQuery {
    /// Session token issued with the session
    pub token: Option<String>,
}

/// Authenticate a tunnel request and bind it to its session
///
/// A bad signature, an expired token, a token for another session and a
/// missing session all produce the same `401`.
pub async fn open(
    state: &AppState,
    id: &SessionId,
    token: Option<&str>,
) -> Result<TunnelContext, Error> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Unauthorized(INVALID_TOKEN.into()))?;

    state.registry.authenticate(id, token).map_err(|e| {
        debug!(session_id = %id, error = %e, "Tunnel authentication failed");
        Error::Unauthorized(INVALID_TOKEN.into())
    })?;

    let lease = state.registry.bind_tunnel(id)?;
    let channel = state
        .connector
        .connect(&lease.session().workload, lease.credential())
        .await?;

    Ok(TunnelContext {
        registry: state.registry.clone(),
        lease,
        channel,
        idle_timeout: state.tunnel_idle_timeout,
    })
}

/// `GET /tunnel/{session_id}?token=...`
#[instrument(skip(state, query, request), fields(session_id = %session_id))]
pub async fn tunnel_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TunnelQuery>,
    request: Request,
) -> Response {
    let id = SessionId::from(session_id);
    let ctx = match open(&state, &id, query.token.as_deref()).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        run_tunnel(sink, stream, ctx).await;
    })
}
