//! Error types for the HTTP service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use hook_reconciler_core::{AttemptId, ResolverError};
use tracing::{error, warn};

/// Webhook handler errors with HTTP status code mapping
///
/// Only rejections that happen before any business logic runs are errors at
/// the transport level. Business failures (unknown tenant, duplicate review,
/// store trouble) are answered with `200` and `success: false`, so none of
/// these variants maps to a `5xx` status. Providers deactivate endpoints that
/// keep answering with server errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookHandlerError {
    /// Signature missing, mismatched, or stale
    ///
    /// Maps to: `401 Unauthorized`. The reason is logged server-side and not
    /// echoed to the caller.
    #[error("Invalid signature")]
    Unauthorized { attempt_id: Option<AttemptId> },

    /// Body could not be decoded or failed schema validation
    ///
    /// Maps to: `400 Bad Request`
    #[error("{message}")]
    InvalidPayload {
        attempt_id: Option<AttemptId>,
        message: String,
        field: Option<String>,
    },

    /// Maps to: `413 Payload Too Large`
    #[error("Payload too large (max: {max_size} bytes)")]
    PayloadTooLarge { max_size: usize },

    /// The request body could not be read at all
    ///
    /// Maps to: `400 Bad Request`
    #[error("Unreadable request body: {message}")]
    UnreadableBody { message: String },
}

impl WebhookHandlerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidPayload { .. } | Self::UnreadableBody { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl IntoResponse for WebhookHandlerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        match &self {
            Self::Unauthorized { attempt_id } => {
                if let Some(id) = attempt_id {
                    body["attemptId"] = serde_json::json!(id);
                }
            }
            Self::InvalidPayload {
                attempt_id, field, ..
            } => {
                if let Some(id) = attempt_id {
                    body["attemptId"] = serde_json::json!(id);
                }
                if let Some(field) = field {
                    body["field"] = serde_json::json!(field);
                }
            }
            Self::PayloadTooLarge { max_size } => {
                warn!(max_size = max_size, "Payload too large");
            }
            Self::UnreadableBody { message } => {
                warn!(error = %message, "Failed to read webhook body");
            }
        }

        (status, Json(body)).into_response()
    }
}

/// Errors from the operator-facing `/admin` routes
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Maps to: `400 Bad Request`
    #[error("Invalid query parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    /// Maps to: `404 Not Found`
    #[error("Attempt not found: {attempt_id}")]
    AttemptNotFound { attempt_id: String },

    /// Maps to: `409 Conflict`
    #[error("{message}")]
    NotReplayable { message: String },

    /// Audit store failure
    ///
    /// Maps to: `503 Service Unavailable` with a generic message.
    #[error("Audit log unavailable: {message}")]
    Unavailable { message: String },
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidParameter { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::AttemptNotFound { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            Self::NotReplayable { .. } => (StatusCode::CONFLICT, self.to_string()),
            Self::Unavailable { message } => {
                error!(error = %message, "Audit log unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Audit log unavailable. Please try again later.".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        (status, Json(body)).into_response()
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Metrics initialisation failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Provider '{provider}' is misconfigured: {message}")]
    ProviderValidation { provider: String, message: String },

    #[error("Secret for provider '{provider}' is unavailable: environment variable '{variable}' is not set")]
    SecretUnavailable { provider: String, variable: String },

    #[error("Tenant table is invalid: {0}")]
    Tenants(#[from] ResolverError),
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
