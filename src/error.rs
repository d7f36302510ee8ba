//! Error taxonomy for the push bridge.
//!
//! Request-level failures (`InvalidMethod` through `SubprocessError`) are
//! mapped onto an HTTP response by [`crate::http::handler`].  `CloneError` and
//! `HookError` only ever surface after the response has been sent, so they are
//! reported through tracing and metrics.

use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid HTTP method")]
    InvalidMethod,

    #[error("Invalid GIT operation")]
    InvalidOperation,

    #[error("Invalid Repository")]
    InvalidRepository,

    #[error("Only Push is available for this GIT url")]
    UnsupportedOperation,

    #[error("Authorization Required")]
    Unauthorized,

    #[error("failed to initialise bare repository for {repo_id}: {source:#}")]
    RepositoryInitError {
        repo_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pack subprocess failed: {0}")]
    SubprocessError(String),

    #[error("failed to clone pushed repository: {0:#}")]
    CloneError(#[source] anyhow::Error),

    #[error("push hook failed: {0:#}")]
    HookError(#[source] anyhow::Error),
}

impl BridgeError {
    /// HTTP status for request-level errors.
    ///
    /// With `legacy` set every error except `Unauthorized` maps to 500, which
    /// is what existing deployments of the bridge have always returned.
    pub fn status_code(&self, legacy: bool) -> StatusCode {
        match self {
            BridgeError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ if legacy => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::InvalidMethod
            | BridgeError::InvalidOperation
            | BridgeError::InvalidRepository => StatusCode::BAD_REQUEST,
            BridgeError::UnsupportedOperation => StatusCode::FORBIDDEN,
            BridgeError::RepositoryInitError { .. }
            | BridgeError::SubprocessError(_)
            | BridgeError::CloneError(_)
            | BridgeError::HookError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the `reason` metric label and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidMethod => "invalid_method",
            BridgeError::InvalidOperation => "invalid_operation",
            BridgeError::InvalidRepository => "invalid_repository",
            BridgeError::UnsupportedOperation => "unsupported_operation",
            BridgeError::Unauthorized => "unauthorized",
            BridgeError::RepositoryInitError { .. } => "repository_init",
            BridgeError::SubprocessError(_) => "subprocess",
            BridgeError::CloneError(_) => "clone",
            BridgeError::HookError(_) => "hook",
        }
    }
}
