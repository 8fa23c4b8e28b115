//! REST-facing error types.
//!
//! Every failure a REST caller can see is an [`ApiError`] and renders as
//!
//! ```json
//! {"error": {"code": "VALIDATION_FAILED", "message": "...", "details": {...}}}
//! ```
//!
//! `code` is stable and machine-readable; `details` is present only for
//! codes that carry structured context.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use duplex_kernel::compat::{ReasonCode, RejectReason};
use duplex_kernel::dispatch::DispatchError;
use serde_json::{Value, json};
use thiserror::Error;

/// Gateway-level errors returned to REST callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("principal '{principal}' may not access '{resource}'")]
    Forbidden { principal: String, resource: String },

    #[error("{0}")]
    Rejected(RejectReason),

    #[error("no route matched {method} '{path}'")]
    RouteNotFound { method: String, path: String },

    #[error("{0} pool is saturated")]
    Overloaded(&'static str),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden { .. } => "FORBIDDEN",
            ApiError::Rejected(reason) => reason.code.as_str(),
            ApiError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            ApiError::Overloaded(_) => "OVERLOADED",
            ApiError::Dispatch(_) => "DISPATCH_FAILED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::Rejected(reason) => match reason.code {
                ReasonCode::UnsupportedMajorVersion
                | ReasonCode::InvalidVersion
                | ReasonCode::MalformedPayload => StatusCode::BAD_REQUEST,
                ReasonCode::ValidationFailed | ReasonCode::TypeMismatch => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ReasonCode::UnknownContract | ReasonCode::UnknownVersion => StatusCode::NOT_FOUND,
            },
            ApiError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::Rejected(reason) if !reason.supported_majors.is_empty() => {
                Some(json!({ "supported_majors": reason.supported_majors }))
            }
            ApiError::Rejected(reason) if !reason.missing_fields.is_empty() => {
                Some(json!({ "missing_fields": reason.missing_fields }))
            }
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Rejected(reason) => reason.message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<RejectReason> for ApiError {
    fn from(reason: RejectReason) -> Self {
        ApiError::Rejected(reason)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code(),
            "message": self.message(),
        });
        if let (Some(details), Some(obj)) = (self.details(), error.as_object_mut()) {
            obj.insert("details".to_string(), details);
        }
        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
