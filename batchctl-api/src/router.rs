use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use batchctl_common::metrics::setup_metrics_router;

use crate::handlers::{batches, files, health, jobs, queue, webhooks};
use crate::state::AppState;

/// Builds the full `batchctl-api` router, following the teacher's `hook-api` split: this
/// function just wires paths to handlers and carries shared `State`; each handler lives in its
/// own module under `handlers/`.
pub fn build(state: AppState) -> Router {
    let router = Router::new()
        .route("/v1/files", post(files::upload_file).layer(DefaultBodyLimit::disable()))
        .route("/v1/files/:id/content", get(files::download_file_content))
        .route("/v1/batches", post(batches::create_batch).get(batches::list_batches))
        .route("/v1/batches/:id", get(batches::get_batch))
        .route("/v1/batches/:id/cancel", post(batches::cancel_batch))
        .route("/v1/queue", get(queue::queue_snapshot))
        .route("/v1/jobs/history", get(jobs::job_history))
        .route("/v1/jobs/stats", get(jobs::job_stats))
        .route("/v1/webhooks/dead-letter", get(webhooks::list_dead_letters))
        .route("/v1/webhooks/dead-letter/:id/retry", post(webhooks::retry_dead_letter))
        .route("/v1/webhooks/dead-letter/:id", delete(webhooks::delete_dead_letter))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(state);

    setup_metrics_router().merge(router)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use batchctl_common::blob::BlobStore;
    use batchctl_common::health::HealthRegistry;
    use batchctl_common::store::Store;

    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config {
            host: "0.0.0.0".to_string(),
            port: 0,
            database_url: "postgres://localhost/test".parse().unwrap(),
            max_pg_connections: 5,
            blob_root: std::env::temp_dir().to_string_lossy().to_string(),
            max_queue_depth: 10,
            heartbeat_offline_threshold_secs: 60,
            job_stats_window_hours: 24,
        }
    }

    #[sqlx::test(migrations = "../batchctl-common/migrations")]
    async fn health_endpoint_is_unhealthy_before_any_component_reports_in(pool: PgPool) {
        let liveness = HealthRegistry::new("batchctl-api");
        let state = AppState {
            store: Store::new(pool),
            blobs: BlobStore::new(std::env::temp_dir()),
            config: test_config(),
            liveness: liveness.clone(),
        };
        liveness.register("router".to_string(), time::Duration::seconds(30)).await;

        let app = build(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[sqlx::test(migrations = "../batchctl-common/migrations")]
    async fn ready_is_unavailable_without_a_heartbeat(pool: PgPool) {
        let liveness = HealthRegistry::new("batchctl-api");
        let state = AppState {
            store: Store::new(pool),
            blobs: BlobStore::new(std::env::temp_dir()),
            config: test_config(),
            liveness,
        };

        let app = build(state);
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
