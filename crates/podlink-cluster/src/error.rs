//! Cluster-side errors

/// Failure of a single cluster API call
#[derive(Debug, Clone, thiserror::Error)]
#[error("cluster API error: {0}")]
pub struct ClusterApiError(pub String);

impl From<kube::Error> for ClusterApiError {
    fn from(e: kube::Error) -> Self {
        ClusterApiError(e.to_string())
    }
}

/// Why minting a scoped credential failed
///
/// Every variant is returned only after the partially created objects have
/// been rolled back.
#[derive(Debug, thiserror::Error)]
pub enum MintError {
    /// Step 1: the principal could not be created
    #[error("failed to create principal: {0}")]
    PrincipalCreateFailed(String),

    /// Step 2: the permission object or binding could not be created
    #[error("failed to bind principal: {0}")]
    BindingFailed(String),

    /// Step 3: the bearer token could not be issued
    #[error("failed to mint token: {0}")]
    TokenMintFailed(String),
}

/// Remote execution failures
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// No cluster client could be built from the credential
    #[error("failed to connect to cluster: {0}")]
    Connect(String),

    /// The exec request was refused or the stream could not be opened
    #[error("exec failed: {0}")]
    Start(String),

    /// The process ended with a failure status that carries no exit code
    #[error("remote execution failed: {0}")]
    Remote(String),

    /// Port-forward could not be established
    #[error("port-forward failed: {0}")]
    PortForward(String),
}
