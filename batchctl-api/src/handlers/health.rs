use axum::extract::State;
use axum::http::StatusCode;

use crate::state::AppState;

/// Process liveness, independent of any dependency. Backed by `HealthRegistry` like every
/// other long-running binary.
pub async fn health(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    state.liveness.get_status()
}

/// Readiness additionally requires the store to be reachable and a recent worker heartbeat.
pub async fn ready(State(state): State<AppState>) -> StatusCode {
    let heartbeat = match state.store.read_heartbeat().await {
        Ok(h) => h,
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE,
    };

    match heartbeat {
        Some(h)
            if (chrono::Utc::now() - h.last_seen)
                <= chrono::Duration::seconds(state.config.heartbeat_offline_threshold_secs) =>
        {
            StatusCode::OK
        }
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
