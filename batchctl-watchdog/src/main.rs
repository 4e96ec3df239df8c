mod config;
mod supervisor;

use std::future::ready;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use futures::future::{select, Either};

use batchctl_common::health::HealthRegistry;
use batchctl_common::metrics::{serve, setup_metrics_router};
use batchctl_common::store::Store;

use config::Config;
use supervisor::Supervisor;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let store = Store::connect(&config.database_url.value, config.max_pg_connections)
        .await
        .expect("failed to connect to store");

    let liveness = HealthRegistry::new("batchctl-watchdog");
    let supervisor_health = liveness
        .register("supervisor".to_string(), time::Duration::seconds(120))
        .await;

    let router = Router::new().route("/health", get(move || ready(liveness.get_status())));
    let router = setup_metrics_router().merge(router);
    let bind = config.bind();
    let http_server = Box::pin(serve(router, &bind));

    let supervisor = Supervisor::new(store, config, supervisor_health);
    let supervisor_loop = Box::pin(supervisor.run());

    match select(http_server, supervisor_loop).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                tracing::error!("failed to start batchctl-watchdog http server: {}", e);
            }
        }
        Either::Right((_, _)) => {
            tracing::error!("batchctl-watchdog supervisor loop exited unexpectedly");
        }
    }
}
