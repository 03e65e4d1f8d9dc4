//! Consume pipeline tasks and run the preprocess, process and save stages.
use std::{future::ready, sync::Arc};

use axum::{routing::get, Router};
use envconfig::Envconfig;
use store_common::metrics::{serve, setup_metrics_routes};
use store_worker::app_context::AppContext;
use store_worker::config::Config;
use store_worker::error::WorkerError;
use store_worker::worker::StoreWorker;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "store worker"
}

fn start_health_liveness_server(
    config: &Config,
    context: Arc<AppContext>,
) -> Result<JoinHandle<()>, WorkerError> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(context.health_registry.get_status())),
        );
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    }))
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    let context = Arc::new(AppContext::without_plugins(&config).await?);

    start_health_liveness_server(&config, context.clone())?;

    let worker = StoreWorker::new(context);
    worker.run().await?;

    Ok(())
}
