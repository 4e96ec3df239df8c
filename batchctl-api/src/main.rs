mod config;
mod error;
mod handlers;
mod router;
mod state;

use envconfig::Envconfig;

use batchctl_common::blob::BlobStore;
use batchctl_common::health::HealthRegistry;
use batchctl_common::metrics::serve;
use batchctl_common::store::Store;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let store = Store::connect(&config.database_url.value, config.max_pg_connections)
        .await
        .expect("failed to connect to store");
    store.migrate().await.expect("failed to run migrations");

    let blobs = BlobStore::new(&config.blob_root);
    blobs.ensure_root().await.expect("failed to create blob root");

    let liveness = HealthRegistry::new("batchctl-api");
    let router_health = liveness
        .register("router".to_string(), time::Duration::seconds(30))
        .await;

    let bind = config.bind();
    let state = AppState {
        store,
        blobs,
        config,
        liveness,
    };
    let app = router::build(state);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            router_health.report_healthy().await;
        }
    });

    if let Err(e) = serve(app, &bind).await {
        tracing::error!("failed to start batchctl-api http server: {}", e);
    }
}
