//! JSON error responses.
//!
//! Every failure leaves the API as `{"error": {"code", "message"}}`. Internal
//! details are logged, never returned.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use shine_core::ContractError;
use shine_lifecycle::LifecycleError;
use shine_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    /// The request conflicts with the record's current state.
    #[error("{0}")]
    Conflict(String),
    /// The payment processor refused or could not be reached.
    #[error("{0}")]
    Upstream(String),
    /// The processor may have acted; a reconciliation pass will settle it.
    #[error("{0}")]
    Pending(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR"),
            Self::Pending(_) => (StatusCode::ACCEPTED, "PENDING_RECONCILIATION"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "internal server error");
                "An internal error occurred".to_string()
            }
            Self::Upstream(detail) => {
                tracing::warn!(error = %detail, "payment gateway error");
                detail.clone()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Quote(err) => Self::Validation(err.to_string()),
            LifecycleError::Contract(err @ ContractError::Validation(_)) => Self::Validation(err.to_string()),
            LifecycleError::Contract(err @ ContractError::InvalidStateTransition { .. }) => {
                Self::Conflict(err.to_string())
            }
            LifecycleError::NotFound { .. } => Self::NotFound(err.to_string()),
            LifecycleError::Store(err @ (StoreError::Conflict { .. } | StoreError::Duplicate { .. })) => {
                Self::Conflict(err.to_string())
            }
            LifecycleError::Store(err @ StoreError::Unavailable(_)) => Self::Unavailable(err.to_string()),
            LifecycleError::GatewayAmbiguous { .. } => Self::Pending(err.to_string()),
            LifecycleError::Gateway(err) => Self::Upstream(err.to_string()),
            other => Self::Internal(format!("{other:#}")),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}
