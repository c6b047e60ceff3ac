//! Identity exchange errors

/// Result type for identity operations
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Failure modes of the login exchange
///
/// None of these are retried internally; the user re-initiates login.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The flow state returned by the client could not be decoded
    #[error("invalid flow state: {0}")]
    InvalidFlowState(String),

    /// The token endpoint answered with a non-success status
    #[error("identity provider rejected the exchange ({status}): {body}")]
    ProviderRejected {
        /// HTTP status returned by the provider
        status: u16,
        /// Truncated response body
        body: String,
    },

    /// The provider answered 2xx with an unparseable body
    #[error("malformed identity provider response: {0}")]
    MalformedProviderResponse(String),

    /// The user-info endpoint refused the access token
    #[error("access token rejected by identity provider ({status})")]
    TokenRejected {
        /// HTTP status returned by the provider
        status: u16,
    },

    /// Network error or timeout talking to the provider
    #[error("identity provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// Invalid client configuration
    #[error("identity configuration error: {0}")]
    Config(String),

    /// Local failure (e.g. entropy source)
    #[error("identity internal error: {0}")]
    Internal(String),
}

impl IdentityError {
    /// Whether the provider refused the caller's code or token
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            IdentityError::ProviderRejected { .. } | IdentityError::TokenRejected { .. }
        )
    }
}

impl From<podlink_common::Error> for IdentityError {
    fn from(e: podlink_common::Error) -> Self {
        IdentityError::Internal(e.to_string())
    }
}
