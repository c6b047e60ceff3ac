//! Error types for the broker

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::locator::LocatorError;
use crate::registry::RegistryError;
use podlink_cluster::{ExecError, MintError};
use podlink_identity::IdentityError;

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or bad credentials at the broker boundary
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Malformed request input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Login exchange failure
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Workload orchestration failure
    #[error(transparent)]
    Locator(#[from] LocatorError),

    /// Session lookup or lifecycle failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Could not reach the workload with the session's credential
    #[error(transparent)]
    Cluster(#[from] ExecError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Identity(e) if e.is_auth_failure() => StatusCode::UNAUTHORIZED,
            Error::Identity(e) => match e {
                IdentityError::InvalidFlowState(_) => StatusCode::BAD_REQUEST,
                IdentityError::MalformedProviderResponse(_) => StatusCode::BAD_GATEWAY,
                IdentityError::ProviderUnreachable(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Locator(e) => match e {
                LocatorError::WorkloadUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                LocatorError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
                LocatorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Registry(e) => match e {
                RegistryError::SessionNotFound(_) | RegistryError::SessionExpired(_) => {
                    StatusCode::NOT_FOUND
                }
                RegistryError::InvalidToken(_) | RegistryError::SubjectMismatch => {
                    StatusCode::UNAUTHORIZED
                }
                RegistryError::TunnelAlreadyBound(_) => StatusCode::CONFLICT,
                RegistryError::Mint(MintError::PrincipalCreateFailed(_))
                | RegistryError::Mint(MintError::BindingFailed(_))
                | RegistryError::Mint(MintError::TokenMintFailed(_)) => StatusCode::BAD_GATEWAY,
                RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Cluster(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = status.as_u16(), error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<MintError> for Error {
    fn from(e: MintError) -> Self {
        Error::Registry(RegistryError::Mint(e))
    }
}
