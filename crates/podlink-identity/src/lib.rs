//! Federated login exchange
//!
//! Implements the broker side of an OAuth 2.0 authorization-code flow with
//! PKCE against an OpenID Connect provider:
//!
//! ```text
//! start_login ──► authorize URL + opaque flow state (verifier inside)
//! complete_login(code, flow state) ──► token endpoint ──► TokenSet
//! validate_access(access token) ──► user-info endpoint ──► IdentityProof
//! refresh(refresh token) ──► token endpoint ──► TokenSet
//! ```
//!
//! Nothing is stored server-side between `start_login` and `complete_login`;
//! the client carries the flow state and must return it verbatim.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod exchange;
pub mod flow;

pub use config::{OidcConfig, ProviderEndpoints};
pub use error::{IdentityError, Result};
pub use exchange::{IdentityExchange, LoginStart, OidcExchange};
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::MockIdentityExchange;
pub use flow::{code_challenge, FlowState};
