mod config;
mod delivery;
mod error;

use std::future::ready;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use futures::future::{select, Either};

use batchctl_common::health::HealthRegistry;
use batchctl_common::metrics::{serve, setup_metrics_router};
use batchctl_common::store::Store;

use config::Config;
use delivery::Dispatcher;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let store = Store::connect(&config.database_url.value, config.max_pg_connections)
        .await
        .expect("failed to connect to store");

    let liveness = HealthRegistry::new("batchctl-dispatcher");
    let dispatcher_health = liveness
        .register("dispatcher".to_string(), time::Duration::seconds(30))
        .await;

    let router = Router::new().route("/health", get(move || ready(liveness.get_status())));
    let router = setup_metrics_router().merge(router);
    let bind = config.bind();
    let http_server = Box::pin(serve(router, &bind));

    let dispatcher = Dispatcher::new(store, config, dispatcher_health);
    let delivery_loop = Box::pin(dispatcher.run());

    match select(http_server, delivery_loop).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                tracing::error!("failed to start batchctl-dispatcher http server: {}", e);
            }
        }
        Either::Right((_, _)) => {
            tracing::error!("batchctl-dispatcher delivery loop exited unexpectedly");
        }
    }
}
