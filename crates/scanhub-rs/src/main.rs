mod adapters;
mod api;
mod config;
mod db;
mod executor;
mod jobs;
mod models;
mod normalize;
mod security;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::sync::{mpsc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    adapters::AdapterRegistry,
    api::{
        create_job, create_target, delete_target, get_job, get_target, health, list_findings,
        list_jobs, list_targets, metrics_by_severity, metrics_by_tool, metrics_summary,
        metrics_timeline, metrics_top_targets,
    },
    config::AppConfig,
    jobs::{resume_queued, worker_loop, JobRunnerState},
};

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub queue: mpsc::Sender<jobs::QueuedJob>,
    pub runner_state: Arc<Mutex<JobRunnerState>>,
    pub config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    // One connection per running job plus headroom for request handlers.
    let max_connections = u32::try_from(config.max_concurrent_jobs)
        .unwrap_or(u32::MAX)
        .saturating_add(4);
    let pool = db::create_pool(&config.database_url, max_connections).await?;
    db::run_migrations(&pool).await?;

    let executor = executor::from_config(&config);
    info!(executor = executor.name(), "process executor ready");
    let registry = Arc::new(AdapterRegistry::from_config(&config, executor));

    let (tx, rx) = mpsc::channel(128);
    let runner_state = Arc::new(Mutex::new(JobRunnerState::default()));

    let state = AppState {
        pool: pool.clone(),
        queue: tx.clone(),
        runner_state: runner_state.clone(),
        config: config.clone(),
    };

    tokio::spawn(worker_loop(
        pool.clone(),
        rx,
        registry,
        runner_state,
        config.max_concurrent_jobs,
    ));

    let resume_pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = resume_queued(&resume_pool, &tx).await {
            error!(error = %e, "could not resume queued jobs");
        }
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/targets", get(list_targets).post(create_target))
        .route("/api/targets/:id", get(get_target).delete(delete_target))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/findings", get(list_findings))
        .route("/api/metrics/summary", get(metrics_summary))
        .route("/api/metrics/by-severity", get(metrics_by_severity))
        .route("/api/metrics/by-tool", get(metrics_by_tool))
        .route("/api/metrics/timeline", get(metrics_timeline))
        .route("/api/metrics/top-targets", get(metrics_top_targets))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "scanhub listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();
}
