//! Broker HTTP server

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use podlink_cluster::WorkloadConnector;
use podlink_identity::IdentityExchange;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::handlers;
use crate::locator::WorkloadLocator;
use crate::registry::{spawn_sweeper, SessionRegistry};
use crate::tunnel::tunnel_handler;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Login exchange with the identity provider
    pub identity: Arc<dyn IdentityExchange>,
    /// Orchestration collaborator owning user workloads
    pub locator: Arc<dyn WorkloadLocator>,
    /// Live sessions
    pub registry: SessionRegistry,
    /// Builds workload channels from scoped credentials
    pub connector: Arc<dyn WorkloadConnector>,
    /// Base for tunnel URLs
    pub public_url: Option<String>,
    /// Idle limit for tunnels
    pub tunnel_idle_timeout: Duration,
}

/// All broker routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Login
        .route("/auth/start", get(handlers::start_login))
        .route("/auth/callback", get(handlers::complete_login))
        .route("/auth/refresh", post(handlers::refresh_login))
        // Sessions
        .route("/session", post(handlers::create_session))
        .route(
            "/session/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/session/{id}/refresh", post(handlers::renew_session_token))
        // WebSocket upgrade, authenticated by the session token query parameter
        .route("/tunnel/{session_id}", get(tunnel_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` fires
///
/// On shutdown every live session is ended first, so open tunnels get a
/// `server_shutdown` notice and every principal is revoked. In-flight
/// requests then get the configured grace period. Sessions created during
/// the grace period are ended once the server has stopped.
pub async fn serve(config: &BrokerConfig, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let tls = match &config.tls {
        Some(files) => Some(
            RustlsConfig::from_pem_file(&files.cert, &files.key)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?,
        ),
        None => None,
    };

    let registry = state.registry.clone();
    let sweeper = spawn_sweeper(
        registry.clone(),
        config.session.sweep_interval,
        shutdown.child_token(),
    );

    let handle = Handle::new();
    {
        let handle = handle.clone();
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let grace = config.shutdown_grace;
        tokio::spawn(async move {
            shutdown.cancelled().await;
            let ended = registry.shutdown().await;
            info!(ended, grace_secs = grace.as_secs(), "Shutting down");
            handle.graceful_shutdown(Some(grace));
        });
    }

    let app = build_router(state).into_make_service();
    let served = match tls {
        Some(tls) => {
            info!(addr = %config.listen_addr, "Starting broker (TLS)");
            axum_server::bind_rustls(config.listen_addr, tls)
                .handle(handle)
                .serve(app)
                .await
        }
        None => {
            info!(addr = %config.listen_addr, "Starting broker");
            axum_server::bind(config.listen_addr)
                .handle(handle)
                .serve(app)
                .await
        }
    };

    shutdown.cancel();
    let _ = sweeper.await;
    let ended = registry.shutdown().await;
    if ended > 0 {
        info!(ended, "Ended sessions created during shutdown");
    }

    served.map_err(|e| Error::Internal(format!("Server error: {}", e)))
}
