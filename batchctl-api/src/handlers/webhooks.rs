use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use batchctl_common::store::{DeliveryState, Page, WebhookEvent};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct DeadLetterResponse {
    pub id: String,
    pub job_id: String,
    pub event: WebhookEvent,
    pub url: String,
    pub attempt_count: i32,
    pub state: DeliveryState,
    pub last_error: Option<String>,
}

impl From<batchctl_common::store::WebhookDelivery> for DeadLetterResponse {
    fn from(d: batchctl_common::store::WebhookDelivery) -> Self {
        Self {
            id: d.id,
            job_id: d.job_id,
            event: d.event,
            url: d.url,
            attempt_count: d.attempt_count,
            state: d.state,
            last_error: d.last_error,
        }
    }
}

#[derive(Deserialize)]
pub struct ListDeadLettersQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListDeadLettersQuery>,
) -> Result<Json<Vec<DeadLetterResponse>>, ApiError> {
    let rows = state
        .store
        .list_dead_letters(Page {
            limit: query.limit.unwrap_or(50),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(rows.into_iter().map(DeadLetterResponse::from).collect()))
}

pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterResponse>, ApiError> {
    let row = state.store.requeue_dead_letter(&id).await?;
    Ok(Json(DeadLetterResponse::from(row)))
}

pub async fn delete_dead_letter(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), ApiError> {
    state.store.delete_dead_letter(&id).await?;
    Ok(())
}
