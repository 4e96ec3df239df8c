use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Binds a `TcpListener` on the provided address and serves a `Router` on it. Intended for the
/// router returned by `setup_metrics_router`, with each binary's own `/_liveness`/`/_readiness`
/// routes added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Builds the `/metrics` router shared by every long-running binary.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request count and latency for every HTTP route in the process.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Names of the domain-specific metrics emitted across the worker, watchdog and dispatcher,
/// collected here so every binary uses the exact same metric name and label set.
pub mod names {
    pub const JOBS_CLAIMED_TOTAL: &str = "batchctl_jobs_claimed_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "batchctl_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "batchctl_jobs_failed_total";
    pub const CHUNK_DURATION_SECONDS: &str = "batchctl_chunk_duration_seconds";
    pub const CHECKPOINT_DURATION_SECONDS: &str = "batchctl_checkpoint_duration_seconds";
    pub const WORKER_RESTARTS_TOTAL: &str = "batchctl_worker_restarts_total";
    pub const WEBHOOK_DELIVERIES_TOTAL: &str = "batchctl_webhook_deliveries_total";
    pub const WEBHOOK_DELIVERY_LATENCY_SECONDS: &str = "batchctl_webhook_delivery_latency_seconds";
}
