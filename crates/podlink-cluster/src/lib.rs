//! Scoped cluster credentials and remote execution
//!
//! # Credential minting
//!
//! ```text
//! mint(workload)
//!   1. ServiceAccount   podlink-session-<uuid>            (principal)
//!   2. Role             podlink-workload-<workload>       (shared, server-side applied)
//!      RoleBinding      podlink-session-<uuid>-binding    (principal -> role)
//!   3. TokenRequest     bounded expiry                    (bearer token)
//! ```
//!
//! The platform has no multi-object transaction, so a failure at step 2 or 3
//! deletes whatever the earlier steps created before the error is returned.
//!
//! # Remote execution
//!
//! [`WorkloadConnector`] turns a minted credential into a [`WorkloadChannel`]
//! that runs commands and forwards ports against the one workload the
//! credential is bound to, using the credential's own bearer token.

#![deny(missing_docs)]

pub mod error;
pub mod exec;
pub mod minter;
pub mod principal;

pub use error::{ClusterApiError, ExecError, MintError};
pub use exec::{
    collect_output, CollectedOutput, ExecOutput, ExecProcess, ExecSpec, ForwardIo,
    KubeConnector, WorkloadChannel, WorkloadConnector,
};
pub use minter::{ClusterCredentialIssuer, MinterConfig, ScopedMinter};
#[cfg(any(test, feature = "test-utils"))]
pub use exec::MockWorkloadConnector;
#[cfg(any(test, feature = "test-utils"))]
pub use minter::MockClusterCredentialIssuer;
pub use principal::{IssuedBearer, KubePrincipalApi, PrincipalApi};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "podlink-broker";

/// Label marking objects created by the broker
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY_PODLINK: &str = "podlink";

/// Label carrying the workload a principal is scoped to
pub const LABEL_WORKLOAD: &str = "podlink.dev/workload";
