use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use batchctl_common::error::CoreError;
use batchctl_common::model;
use batchctl_common::store::{Job, JobFilter, JobStatus, NewJobSpec, Page, TransitionPatch};

use crate::error::ApiError;
use crate::state::AppState;

const ALLOWED_WEBHOOK_EVENTS: [&str; 3] = ["completed", "failed", "progress"];
const MAX_METADATA_ENTRIES: usize = 16;
const MAX_METADATA_VALUE_BYTES: usize = 512;
/// Used in place of `average_throughput` when no job has completed in the stats window yet.
const BOOTSTRAP_THROUGHPUT_RPS: f64 = 2.0;

#[derive(Deserialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub completion_window: Option<String>,
    #[serde(default)]
    pub priority: Option<i16>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_events: Vec<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub id: String,
    pub status: JobStatus,
    pub priority: i16,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub model: String,
    pub total_requests: i64,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub queue_position: Option<i64>,
    pub estimated_start_time: Option<DateTime<Utc>>,
    pub estimated_completion_time: Option<DateTime<Utc>>,
    pub metadata: JsonValue,
    pub errors: Option<JsonValue>,
}

pub(crate) async fn to_response(state: &AppState, job: Job) -> Result<BatchResponse, ApiError> {
    let queue_position = state.store.queue_position(&job).await?;

    // spec.md:79 — estimated_start_time(J) = now + expected duration of each job ahead;
    // estimated_completion_time(J) = estimated_start_time(J) + total_requests(J) / throughput_estimate.
    let (estimated_start_time, estimated_completion_time) = match queue_position {
        Some(position) if position > 0 => {
            let window = chrono::Duration::hours(state.config.job_stats_window_hours);
            let stats = state.store.job_stats(window).await?;
            let start = stats
                .average_duration_seconds
                .map(|secs| Utc::now() + chrono::Duration::seconds((secs * position as f64) as i64));
            let throughput = stats.average_throughput.unwrap_or(BOOTSTRAP_THROUGHPUT_RPS).max(0.01);
            let completion = start.map(|start| {
                start + chrono::Duration::seconds((job.total_requests as f64 / throughput) as i64)
            });
            (start, completion)
        }
        _ => (None, None),
    };

    Ok(BatchResponse {
        id: job.id,
        status: job.status,
        priority: job.priority,
        input_file_id: job.input_file_id,
        output_file_id: job.output_file_id,
        error_file_id: job.error_file_id,
        model: job.model,
        total_requests: job.total_requests,
        completed_requests: job.completed_requests,
        failed_requests: job.failed_requests,
        created_at: job.created_at,
        completed_at: job.completed_at,
        failed_at: job.failed_at,
        cancelled_at: job.cancelled_at,
        queue_position,
        estimated_start_time,
        estimated_completion_time,
        metadata: job.metadata,
        errors: job.errors,
    })
}

fn validate_metadata(metadata: &JsonValue) -> Result<(), ApiError> {
    let Some(map) = metadata.as_object() else {
        return Err(ApiError::from(CoreError::InvalidInput(
            "metadata must be a JSON object".to_string(),
        )));
    };
    if map.len() > MAX_METADATA_ENTRIES {
        return Err(ApiError::from(CoreError::InvalidInput(format!(
            "metadata has {} entries, limit is {MAX_METADATA_ENTRIES}",
            map.len()
        ))));
    }
    for (key, value) in map {
        let size = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
        if size > MAX_METADATA_VALUE_BYTES {
            return Err(ApiError::from(CoreError::InvalidInput(format!(
                "metadata value for {key} exceeds {MAX_METADATA_VALUE_BYTES} bytes"
            ))));
        }
    }
    Ok(())
}

/// Counts non-empty lines and validates the first record has the shape of a chat-completion
/// request, returning the total record count and the model named in that first record's body
/// (the model the whole job runs under, same convention as the worker's `input::summarize`,
/// kept as a separate implementation since the worker is a binary crate).
async fn validate_input_file(state: &AppState, file_id: &str) -> Result<(i64, String), ApiError> {
    let bytes = state.blobs.read(file_id).await?;
    let text = String::from_utf8_lossy(&bytes);

    let mut total = 0i64;
    let mut first_line: Option<&str> = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if first_line.is_none() {
            first_line = Some(line);
        }
        total += 1;
    }

    let Some(line) = first_line else {
        return Err(ApiError::from(CoreError::InvalidInput(
            "input file is empty".to_string(),
        )));
    };

    let record: JsonValue = serde_json::from_str(line)
        .map_err(|e| ApiError::from(CoreError::InvalidInput(format!("first record is not valid JSON: {e}"))))?;
    if !record.get("custom_id").is_some_and(|v| v.is_string()) {
        return Err(ApiError::from(CoreError::InvalidInput(
            "first record is missing custom_id".to_string(),
        )));
    }
    let model = record
        .get("body")
        .and_then(|b| b.get("model"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ApiError::from(CoreError::InvalidInput(
                "first record is missing body.model".to_string(),
            ))
        })?
        .to_string();

    Ok((total, model))
}

pub async fn create_batch(
    State(state): State<AppState>,
    Json(req): Json<CreateBatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if req.endpoint != "/v1/chat/completions" {
        return Err(ApiError::from(CoreError::InvalidInput(format!(
            "unsupported endpoint: {}",
            req.endpoint
        ))));
    }

    let priority = req.priority.unwrap_or(0);
    if !(-1..=1).contains(&priority) {
        return Err(ApiError::from(CoreError::InvalidInput(
            "priority must be -1, 0, or 1".to_string(),
        )));
    }

    for event in &req.webhook_events {
        if !ALLOWED_WEBHOOK_EVENTS.contains(&event.as_str()) {
            return Err(ApiError::from(CoreError::InvalidInput(format!(
                "unknown webhook event: {event}"
            ))));
        }
    }

    let metadata = req.metadata.unwrap_or_else(|| serde_json::json!({}));
    validate_metadata(&metadata)?;

    let file = state.store.get_file(&req.input_file_id).await?;
    let (total_requests, model) = validate_input_file(&state, &file.id).await?;

    if model::lookup(&model).is_none() {
        return Err(ApiError::from(CoreError::InvalidInput(format!(
            "unknown or disabled model: {model}"
        ))));
    }

    let heartbeat = state.store.read_heartbeat().await?;
    let online = heartbeat.is_some_and(|h| {
        Utc::now() - h.last_seen <= chrono::Duration::seconds(state.config.heartbeat_offline_threshold_secs)
    });
    if !online {
        return Err(ApiError::from(CoreError::ServiceUnavailable));
    }

    let job = state
        .store
        .create_job(
            NewJobSpec {
                id: uuid::Uuid::now_v7().to_string(),
                input_file_id: file.id,
                model,
                priority,
                total_requests,
                webhook_url: req.webhook_url,
                webhook_events: req.webhook_events,
                metadata,
            },
            state.config.max_queue_depth,
        )
        .await?;

    Ok(Json(to_response(&state, job).await?))
}

pub async fn get_batch(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<BatchResponse>, ApiError> {
    let job = state.store.get_job(&id).await?;
    Ok(Json(to_response(&state, job).await?))
}

pub async fn cancel_batch(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<BatchResponse>, ApiError> {
    let job = state.store.get_job(&id).await?;
    state.store.request_cancel(&id).await?;

    let job = if job.status == JobStatus::Validating {
        state
            .store
            .transition_job(&id, JobStatus::Validating, JobStatus::Cancelled, TransitionPatch::default())
            .await?
    } else {
        state.store.get_job(&id).await?
    };

    Ok(Json(to_response(&state, job).await?))
}

#[derive(Deserialize)]
pub struct ListBatchesQuery {
    pub status: Option<JobStatus>,
    pub model: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<ListBatchesQuery>,
) -> Result<Json<Vec<BatchResponse>>, ApiError> {
    let jobs = state
        .store
        .list_jobs(
            JobFilter {
                status: query.status,
                model: query.model,
            },
            Page {
                limit: query.limit.unwrap_or(50),
                offset: query.offset.unwrap_or(0),
            },
        )
        .await?;

    let mut responses = Vec::with_capacity(jobs.len());
    for job in jobs {
        responses.push(to_response(&state, job).await?);
    }
    Ok(Json(responses))
}
