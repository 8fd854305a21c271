//! Error mapping from service errors to HTTP responses.
//!
//! Handlers return [`ApiError`]; its body carries `error`, `message` and an
//! optional `details` object. [`crate::middleware::error_envelope`] then adds
//! the request-level fields of the envelope to every error response,
//! including rejections produced by axum extractors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

use stockline_adapters::RegistryError;
use stockline_core::DomainError;
use stockline_infra::catalog::CatalogError;
use stockline_infra::ledger::LedgerError;
use stockline_infra::sync::SyncError;
use stockline_infra::webhooks::WebhookError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    Unprocessable {
        message: String,
        details: Option<Value>,
    },

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        ApiError::Unprocessable {
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, details) = match self {
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                ("Internal server error".to_string(), None)
            }
            ApiError::Unprocessable { message, details } => (message, details),
            other => (other.to_string(), None),
        };

        let mut body = json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": message,
        });
        if let Some(details) = details {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(_) | DomainError::InvalidId(_) => {
                ApiError::Validation(err.to_string())
            }
            DomainError::NotFound(_) => ApiError::NotFound(err.to_string()),
            DomainError::Conflict(_) => ApiError::Conflict(err.to_string()),
            DomainError::InvariantViolation(_) => ApiError::unprocessable(err.to_string()),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Domain(e) => e.into(),
            CatalogError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::ValidationFailed(_) => ApiError::Validation(err.to_string()),
            LedgerError::TenantNotFound(_)
            | LedgerError::ProductNotFound(_)
            | LedgerError::ReservationNotFound(_) => ApiError::NotFound(err.to_string()),
            LedgerError::LocationMismatch(_) | LedgerError::InvariantViolation(_) => {
                ApiError::unprocessable(err.to_string())
            }
            LedgerError::InsufficientStock {
                location_id,
                current,
                requested,
            } => ApiError::Unprocessable {
                message: err.to_string(),
                details: Some(json!({
                    "locationId": location_id,
                    "current": current,
                    "requested": requested,
                })),
            },
            LedgerError::DuplicateReference(_) => ApiError::Conflict(err.to_string()),
            LedgerError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning { .. }
            | SyncError::InvalidTransition { .. }
            | SyncError::Cancelled => ApiError::Conflict(err.to_string()),
            SyncError::NotBound { .. } | SyncError::TenantNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            SyncError::Registry(RegistryError::AdapterNotFound(_)) => {
                ApiError::NotFound(err.to_string())
            }
            SyncError::Registry(_) => ApiError::Validation(err.to_string()),
            SyncError::AdapterUnavailable(_) => ApiError::Unavailable(err.to_string()),
            SyncError::StepFailed { .. } => ApiError::BadGateway(err.to_string()),
            SyncError::Ledger(e) => e.into(),
            SyncError::Catalog(e) => e.into(),
            SyncError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::UnknownProvider(_) => ApiError::NotFound(err.to_string()),
            WebhookError::Rejected(_) => ApiError::Validation(err.to_string()),
            WebhookError::QueueClosed => ApiError::Unavailable(err.to_string()),
        }
    }
}
