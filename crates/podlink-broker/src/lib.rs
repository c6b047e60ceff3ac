//! Podlink session broker
//!
//! Turns a federated login into a minute-lived cluster credential bound to
//! one workload, and relays exec, file and port-forward traffic for it over
//! a single authenticated WebSocket.
//!
//! # Architecture
//!
//! ```text
//! client ──► /auth/*    ──► IdentityExchange (PKCE) ──► identity provider
//!        ──► /session   ──► WorkloadLocator ──► hub
//!                       ──► SessionRegistry ──► ClusterCredentialIssuer ──► K8s API
//!        ──► /tunnel/id ──► tunnel multiplexer ──► WorkloadChannel ──► pod
//! ```
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness
//! - `GET /auth/start` - Authorization URL and opaque flow state
//! - `GET /auth/callback` - Exchange code and flow state for tokens
//! - `POST /auth/refresh` - Exchange a refresh token
//! - `POST /session` - Create a session for a validated access token
//! - `GET|DELETE /session/{id}` - Inspect or end a session
//! - `POST /session/{id}/refresh` - Issue a new session token
//! - `GET /tunnel/{id}?token=...` - WebSocket tunnel

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod locator;
pub mod registry;
pub mod server;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod scenarios;

pub use config::{BrokerConfig, SessionSettings, TlsFiles};
pub use error::{Error, Result};
pub use locator::{HubConfig, HubWorkloadLocator, WorkloadLocator};
pub use registry::{RegistryConfig, SessionRegistry, SessionTokenSigner};
pub use server::{build_router, serve, AppState};
