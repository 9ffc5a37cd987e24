//! Error taxonomy and HTTP mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure to bring a backend to `Ready`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StartError {
    #[error("backend did not become healthy within {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn backend process: {0}")]
    ProcessSpawnFailed(String),

    #[error("{0}")]
    Other(String),
}

/// Failure to release a backend; the GPU must not be assumed free
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StopError {
    #[error("backend process unresponsive: {0}")]
    ProcessUnresponsive(String),
}

/// Outcome of an arbitration attempt
///
/// Cloned to every caller that joined the same in-flight switch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SwitchError {
    #[error("automatic backend switching is disabled")]
    Disabled,

    #[error("backend switch failed: {cause}")]
    StartFailed { cause: String },

    #[error("backend switch timed out")]
    Timeout,
}

impl From<StartError> for SwitchError {
    fn from(err: StartError) -> Self {
        SwitchError::StartFailed {
            cause: err.to_string(),
        }
    }
}

impl From<StopError> for SwitchError {
    fn from(err: StopError) -> Self {
        SwitchError::StartFailed {
            cause: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download job '{0}' not found")]
    NotFound(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid file reference: {0}")]
    InvalidFile(String),

    #[error("download job '{0}' already finished")]
    NotCancelable(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid model name: {0}")]
    InvalidName(String),

    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("model '{0}' is loaded by the resident backend")]
    InUse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to HTTP callers
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RouteError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) | Self::NotFound(_) => "invalid_request_error",
            Self::Conflict(_) => "conflict_error",
            Self::BadGateway(_) | Self::ServiceUnavailable(_) => "backend_error",
            Self::Internal(_) => "server_error",
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = self.error_type();
        let message = match self {
            RouteError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type,
                code: status.as_u16(),
            },
        });

        (status, body).into_response()
    }
}

impl From<SwitchError> for RouteError {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Disabled => RouteError::Conflict(err.to_string()),
            SwitchError::StartFailed { .. } | SwitchError::Timeout => {
                RouteError::ServiceUnavailable(err.to_string())
            }
        }
    }
}

impl From<DownloadError> for RouteError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::NotFound(_) => RouteError::NotFound(err.to_string()),
            DownloadError::InvalidFile(_) => RouteError::BadRequest(err.to_string()),
            DownloadError::AlreadyExists(_) | DownloadError::NotCancelable(_) => {
                RouteError::Conflict(err.to_string())
            }
            DownloadError::TransferFailed(_) => RouteError::BadGateway(err.to_string()),
        }
    }
}

impl From<CatalogError> for RouteError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::InvalidName(_) => RouteError::BadRequest(err.to_string()),
            CatalogError::NotFound(_) => RouteError::NotFound(err.to_string()),
            CatalogError::InUse(_) => RouteError::Conflict(err.to_string()),
            CatalogError::Io(e) => RouteError::Internal(e.into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
    code: u16,
}
