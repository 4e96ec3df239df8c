use axum::extract::{Multipart, Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use bytes::Bytes;

use batchctl_common::error::CoreError;
use batchctl_common::store::FilePurpose;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct FileResponse {
    pub id: String,
    pub bytes: i64,
    pub created_at: DateTime<Utc>,
    pub filename: String,
    pub purpose: FilePurpose,
}

pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<FileResponse>, ApiError> {
    let mut purpose: Option<String> = None;
    let mut filename = "upload.jsonl".to_string();
    let mut contents: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from(CoreError::InvalidInput(e.to_string())))?
    {
        match field.name().unwrap_or("") {
            "purpose" => {
                purpose = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::from(CoreError::InvalidInput(e.to_string())))?,
                );
            }
            "file" => {
                if let Some(name) = field.file_name() {
                    filename = name.to_string();
                }
                contents = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::from(CoreError::InvalidInput(e.to_string())))?,
                );
            }
            _ => {}
        }
    }

    let purpose = purpose.ok_or_else(|| ApiError::from(CoreError::InvalidInput("missing purpose field".to_string())))?;
    if purpose != "batch" {
        return Err(ApiError::from(CoreError::InvalidInput(format!(
            "unsupported purpose: {purpose}"
        ))));
    }

    let contents = contents.ok_or_else(|| ApiError::from(CoreError::InvalidInput("missing file field".to_string())))?;

    let id = uuid::Uuid::now_v7().to_string();
    let sha256 = state.blobs.write_all(&id, &contents).await?;

    let file = state
        .store
        .create_file(&id, FilePurpose::Batch, &filename, contents.len() as i64, &sha256)
        .await?;

    Ok(Json(FileResponse {
        id: file.id,
        bytes: file.bytes,
        created_at: file.created_at,
        filename: file.filename,
        purpose: file.purpose,
    }))
}

pub async fn download_file_content(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    state.store.get_file(&id).await?;
    let bytes = state.blobs.read(&id).await?;
    Ok((
        [("content-type", "application/octet-stream")],
        bytes,
    )
        .into_response())
}
