//! Shared types for the podlink broker
//!
//! Everything that crosses a crate boundary lives here: the identity and
//! token records produced by the login exchange, the workload location
//! reported by the orchestration collaborator, the scoped cluster credential
//! minted per session, and the JSON messages carried over a tunnel.

#![deny(missing_docs)]

pub mod error;
pub mod random;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use types::{
    IdentityProof, PrincipalHandle, ScopedCredential, SessionId, TokenSet, WorkloadLocation,
    WorkloadStatus,
};
