//! tally-api - HTTP API server for the tally categorization pipeline.

mod app;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_classify::OpenAiClassifier;
use tally_core::{defaults, JobStoreConfig};
use tally_db::Storage;
use tally_jobs::{WorkerConfig, WorkerPool};

use app::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Storage backend: Postgres when configured, in-memory otherwise.
    let job_config = JobStoreConfig::from_env();
    let storage = match std::env::var("TALLY_DATABASE_URL") {
        Ok(url) => {
            info!("Connecting to PostgreSQL");
            Storage::connect(&url, job_config).await?
        }
        Err(_) => {
            info!("TALLY_DATABASE_URL not set, using in-memory storage");
            Storage::in_memory(job_config)
        }
    };

    let worker_config = WorkerConfig::from_env();
    let worker_active = worker_config.enabled;
    let classifier = Arc::new(OpenAiClassifier::from_env());
    let pool = WorkerPool::new(storage.clone(), classifier, worker_config);
    let worker_handle = pool.start();

    let state = AppState::new(storage, worker_active);
    let router = app::router(state);

    let port = std::env::var("TALLY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(defaults::SERVER_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight jobs before exiting.
    info!("Shutting down worker pool");
    worker_handle.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
