use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use batchctl_common::store::{JobHistoryFilter, JobStats, JobStatus, Page};

use crate::error::ApiError;
use crate::handlers::batches::BatchResponse;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct JobHistoryQuery {
    pub status: Option<JobStatus>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn job_history(
    State(state): State<AppState>,
    Query(query): Query<JobHistoryQuery>,
) -> Result<Json<Vec<BatchResponse>>, ApiError> {
    let jobs = state
        .store
        .job_history(
            JobHistoryFilter {
                status: query.status,
                model: query.model,
                since: query.since,
                until: query.until,
            },
            Page {
                limit: query.limit.unwrap_or(50),
                offset: query.offset.unwrap_or(0),
            },
        )
        .await?;

    let mut responses = Vec::with_capacity(jobs.len());
    for job in jobs {
        responses.push(crate::handlers::batches::to_response(&state, job).await?);
    }
    Ok(Json(responses))
}

#[derive(Deserialize)]
pub struct JobStatsQuery {
    #[serde(default)]
    pub window_hours: Option<i64>,
}

pub async fn job_stats(
    State(state): State<AppState>,
    Query(query): Query<JobStatsQuery>,
) -> Result<Json<JobStats>, ApiError> {
    let window = chrono::Duration::hours(query.window_hours.unwrap_or(state.config.job_stats_window_hours));
    Ok(Json(state.store.job_stats(window).await?))
}
