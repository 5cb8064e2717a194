//! Typed error taxonomy with HTTP status mapping.
//!
//! Every failure that can leave the pipeline is an [`ApiError`] variant with
//! a fixed status code. Classification is done on the variant, never on the
//! message text - the one exception is the `From<anyhow::Error>` conversion,
//! which keeps a bounded substring fallback for errors that escaped typed
//! construction (see [`classify_untyped`]).
//!
//! # Wire Shape
//!
//! All non-2xx responses serialize to:
//!
//! ```json
//! { "error": "...", "details": ..., "timestamp": "2026-01-01T00:00:00.000Z" }
//! ```
//!
//! Validation errors always carry `details` (the per-field breakdown); other
//! kinds carry `details` only when the error policy enables it, so internals
//! are not leaked by default.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::schema::FieldError;

/// Flat error category, used as the key of per-kind policy overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorKind {
    /// Default HTTP status code for this kind.
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Pipeline-wide error type with appropriate HTTP status codes.
///
/// Handlers and policy layers either produce a complete response themselves
/// or return one of these; nothing is silently swallowed. The error
/// normalizer catches every `Err` exactly once at the outermost layer.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<FieldError>,
    },

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    /// Build a validation error from collected field errors.
    pub fn validation(details: Vec<FieldError>) -> Self {
        ApiError::Validation {
            message: "Validation failed".to_string(),
            details,
        }
    }

    /// Canonical 401 for a missing or unresolvable identity.
    pub fn authentication_required() -> Self {
        ApiError::Authentication("Authentication required".to_string())
    }

    /// Canonical 403 for a caller outside the admin allow-list.
    pub fn admin_required() -> Self {
        ApiError::Authorization("Admin access required".to_string())
    }

    /// The flat category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Authentication(_) => ErrorKind::Authentication,
            ApiError::Authorization(_) => ErrorKind::Authorization,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Default status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Message safe to show to callers.
    ///
    /// Internal errors are sanitized to a generic message; the full source
    /// chain only ever reaches the server-side log.
    pub fn client_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Structured `details` payload for the response body.
    ///
    /// Validation errors always expose their field breakdown. Other kinds
    /// expose the error text only when `include_details` is set.
    pub fn details_value(&self, include_details: bool) -> Option<serde_json::Value> {
        match self {
            ApiError::Validation { details, .. } => serde_json::to_value(details).ok(),
            ApiError::Internal(source) if include_details => {
                Some(serde_json::Value::String(format!("{source:#}")))
            }
            other if include_details => Some(serde_json::Value::String(other.to_string())),
            _ => None,
        }
    }
}

/// Map a free-form error message to an [`ErrorKind`].
///
/// Legacy fallback only: substring matching is inherently ambiguous (an
/// unrelated message containing "forbidden" lands on 403), so it is reserved
/// for untyped errors crossing the `anyhow` seam. Everything inside this
/// crate constructs typed variants directly.
pub fn classify_untyped(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();

    if lowered.contains("duplicate key") || lowered.contains("foreign key") {
        ErrorKind::Conflict
    } else if lowered.contains("not found") {
        ErrorKind::NotFound
    } else if lowered.contains("unauthorized") {
        ErrorKind::Authentication
    } else if lowered.contains("forbidden") {
        ErrorKind::Authorization
    } else if lowered.contains("rate limit") {
        ErrorKind::RateLimited
    } else {
        ErrorKind::Internal
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        match classify_untyped(&message) {
            ErrorKind::NotFound => ApiError::NotFound(message),
            ErrorKind::Conflict => ApiError::Conflict(message),
            ErrorKind::Authentication => ApiError::Authentication(message),
            ErrorKind::Authorization => ApiError::Authorization(message),
            ErrorKind::RateLimited => ApiError::RateLimited {
                message,
                retry_after_secs: 1,
            },
            _ => ApiError::Internal(err),
        }
    }
}

/// Error response body shared by every non-2xx outcome.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ErrorBody {
    /// Build a body with the current timestamp attached.
    pub fn new(message: String, details: Option<serde_json::Value>) -> Self {
        Self {
            error: message,
            details,
            timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

/// Direct response conversion for use outside a composed pipeline.
///
/// Inside the pipeline the error normalizer owns logging and response
/// construction; this impl exists so `ApiError` remains usable from plain
/// axum handlers. Validation details are included, other details are not.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(kind = self.kind().as_str(), error = %self, "Request failed");

        let body = ErrorBody::new(self.client_message(), self.details_value(false));
        (self.status_code(), axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with ApiError.
pub type ApiResult<T> = Result<T, ApiError>;
