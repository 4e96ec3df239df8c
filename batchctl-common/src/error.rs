use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The full taxonomy of errors the control plane can surface, spanning validation,
/// scheduling, inference, checkpointing, and webhook delivery.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("queue is full")]
    QueueFull,
    #[error("worker is offline")]
    ServiceUnavailable,
    #[error("failed to load model {model}: {reason}")]
    ModelLoadFailed { model: String, reason: String },
    #[error("inference request timed out")]
    InferenceTimeout,
    #[error("inference engine error: {0}")]
    InferenceEngineError(String),
    #[error("checkpoint write failed: {0}")]
    CheckpointIOError(String),
    #[error("webhook delivery failed but may be retried: {0}")]
    WebhookTransport(String),
    #[error("webhook delivery failed permanently: {0}")]
    WebhookTerminal(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, used in the `{error: {code}}` envelope and in metrics
    /// labels so dashboards don't depend on the (human-facing) message text.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::QueueFull => "queue_full",
            CoreError::ServiceUnavailable => "service_unavailable",
            CoreError::ModelLoadFailed { .. } => "model_load_failed",
            CoreError::InferenceTimeout => "inference_timeout",
            CoreError::InferenceEngineError(_) => "inference_engine_error",
            CoreError::CheckpointIOError(_) => "checkpoint_io_error",
            CoreError::WebhookTransport(_) => "webhook_transport",
            CoreError::WebhookTerminal(_) => "webhook_terminal",
            CoreError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            CoreError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ModelLoadFailed { .. }
            | CoreError::InferenceTimeout
            | CoreError::InferenceEngineError(_)
            | CoreError::CheckpointIOError(_)
            | CoreError::WebhookTransport(_)
            | CoreError::WebhookTerminal(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The stable `{error: {message, type, code}}` envelope every `batchctl-api` handler returns
/// on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: &'static str,
    pub code: &'static str,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                r#type: "core_error",
                code: self.code(),
            },
        };
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_queue_full_to_429() {
        let response = CoreError::QueueFull.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn maps_service_unavailable_to_503() {
        let response = CoreError::ServiceUnavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn maps_conflict_to_409() {
        let response = CoreError::Conflict("job is terminal".to_owned()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
