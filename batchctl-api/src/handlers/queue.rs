use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct QueueSnapshot {
    pub depth: i64,
    pub in_progress_id: Option<String>,
    pub heartbeat_age_seconds: Option<i64>,
    pub worker_status: &'static str,
}

pub async fn queue_snapshot(State(state): State<AppState>) -> Result<Json<QueueSnapshot>, ApiError> {
    let depth = state.store.queue_depth().await?;
    let heartbeat = state.store.read_heartbeat().await?;

    let (in_progress_id, heartbeat_age_seconds, worker_status) = match heartbeat {
        Some(h) => {
            let age = (Utc::now() - h.last_seen).num_seconds();
            let status = if age <= state.config.heartbeat_offline_threshold_secs {
                "online"
            } else {
                "offline"
            };
            (h.current_job_id, Some(age), status)
        }
        None => (None, None, "offline"),
    };

    Ok(Json(QueueSnapshot {
        depth,
        in_progress_id,
        heartbeat_age_seconds,
        worker_status,
    }))
}
