use axum::response::{IntoResponse, Response};

use batchctl_common::blob::BlobError;
use batchctl_common::error::CoreError;
use batchctl_common::store::StoreError;

/// Thin wrapper so every handler can return `Result<_, ApiError>` and rely on a single
/// `IntoResponse` impl, mirroring the teacher's `capture::api::CaptureError` mapping.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] CoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(CoreError::from(err))
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        ApiError(CoreError::Internal(err.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.0.into_response()
    }
}
