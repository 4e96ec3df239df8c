mod config;
mod engine;
mod error;
mod input;
mod lock;
mod worker;

use std::future::ready;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use batchctl_common::blob::BlobStore;
use batchctl_common::health::HealthRegistry;
use batchctl_common::metrics::{serve, setup_metrics_router};
use batchctl_common::store::Store;

use config::Config;
use engine::StubInferenceEngine;
use error::WorkerError;
use lock::WorkerLock;
use worker::Worker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let _lock = WorkerLock::acquire(&config.lock_file_path)
        .unwrap_or_else(|e| panic!("failed to acquire GPU lock: {e}"));

    let liveness = HealthRegistry::new("batchctl-worker");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let store = Store::connect(&config.database_url.value, config.max_pg_connections)
        .await?;
    store.migrate().await?;

    let blobs = BlobStore::new(&config.blob_root);

    let router = Router::new()
        .route("/health", get(move || ready(liveness.get_status())))
        .route("/ready", get(move || ready("ok")));
    let router = setup_metrics_router().merge(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start metrics server");
    });

    let mut worker = Worker::new(store, blobs, StubInferenceEngine, config, worker_liveness);
    worker.run().await
}
