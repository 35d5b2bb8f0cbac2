//! Job Orchestrator: drives a queued job through its tools and into a terminal state.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    adapters::AdapterRegistry,
    db,
    models::{JobStatus, JobWithTarget, NewFinding},
    normalize::tool_error,
};

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
}

#[derive(Debug, Default)]
pub struct JobRunnerState {
    pub running: usize,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("job {id} is {status:?}, not queued")]
    NotQueued { id: Uuid, status: JobStatus },

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// Runs one job to completion on its own pooled connection.
///
/// A missing job is a no-op; a job that is no longer QUEUED is left untouched.
pub async fn run_job(pool: &SqlitePool, registry: &AdapterRegistry, job_id: Uuid) {
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(%job_id, error = %e, "no database connection for job, leaving it queued");
            return;
        }
    };

    match drive(&mut conn, registry, job_id).await {
        Ok(status) => info!(%job_id, ?status, "job finished"),
        Err(OrchestratorError::JobNotFound(_)) => debug!(%job_id, "job not found, nothing to run"),
        Err(e @ OrchestratorError::NotQueued { .. }) => warn!(%job_id, reason = %e, "job skipped"),
        Err(e @ OrchestratorError::Persistence(_)) => {
            error!(%job_id, error = %e, "job orchestration failed");
            mark_failed(&mut conn, job_id).await;
        }
    }
}

async fn drive(
    conn: &mut SqliteConnection,
    registry: &AdapterRegistry,
    job_id: Uuid,
) -> Result<JobStatus, OrchestratorError> {
    let JobWithTarget { job, target_url } = db::fetch_job_with_target(conn, job_id)
        .await?
        .ok_or(OrchestratorError::JobNotFound(job_id))?;

    if job.status != JobStatus::Queued {
        return Err(OrchestratorError::NotQueued {
            id: job_id,
            status: job.status,
        });
    }
    if !db::mark_running(conn, job_id, Utc::now()).await? {
        let status = db::fetch_job(conn, job_id)
            .await?
            .map(|j| j.status)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        return Err(OrchestratorError::NotQueued { id: job_id, status });
    }
    info!(%job_id, target = %target_url, tools = ?job.tools_used, "job running");

    for tool in &job.tools_used {
        let findings = run_tool(registry, tool, &target_url).await;
        let stored = db::insert_findings(conn, job_id, tool, &findings).await?;
        info!(%job_id, %tool, findings = stored, "tool findings stored");
    }

    let current = db::fetch_job(conn, job_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    if current.status != JobStatus::Running {
        warn!(%job_id, status = ?current.status, "job changed while running, keeping its state");
        return Ok(current.status);
    }
    if !db::mark_finished(conn, job_id, JobStatus::Done, Utc::now()).await? {
        return Err(sqlx::Error::RowNotFound.into());
    }
    Ok(JobStatus::Done)
}

/// Runs one tool in its own task so that nothing it does can abort the job.
async fn run_tool(registry: &AdapterRegistry, tool: &str, target_url: &str) -> Vec<NewFinding> {
    let Some(adapter) = registry.get(tool) else {
        warn!(%tool, "no adapter registered for tool");
        return vec![NewFinding::info("Unknown Tool")
            .description(format!("No scanner adapter is registered for tool {tool}"))
            .evidence(tool)
            .recommendation("Request one of the supported tools: ZAP, Nuclei, SSLyze.")];
    };

    let kind = adapter.tool();
    let target = target_url.to_string();
    match tokio::spawn(async move { adapter.scan(&target).await }).await {
        Ok(findings) => findings,
        Err(e) => {
            warn!(%tool, error = %e, "scanner adapter task failed");
            vec![tool_error(
                kind,
                &format!("adapter task failed: {e}"),
                "Inspect the service logs for the adapter failure.",
            )]
        }
    }
}

async fn mark_failed(conn: &mut SqliteConnection, job_id: Uuid) {
    match db::mark_finished(conn, job_id, JobStatus::Failed, Utc::now()).await {
        Ok(true) => info!(%job_id, "job marked failed"),
        Ok(false) => warn!(%job_id, "job not running or no longer reachable, failure not recorded"),
        Err(e) => error!(%job_id, error = %e, "could not record job failure"),
    }
}

/// Receives queued jobs and runs each one as an independent task.
///
/// The queue is drained as fast as jobs arrive; each task waits for one of
/// `max_concurrent` permits before it starts, so senders never wait on a scan.
pub async fn worker_loop(
    pool: SqlitePool,
    mut rx: mpsc::Receiver<QueuedJob>,
    registry: Arc<AdapterRegistry>,
    runner_state: Arc<Mutex<JobRunnerState>>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

    while let Some(job) = rx.recv().await {
        let permits = permits.clone();
        let pool = pool.clone();
        let registry = registry.clone();
        let runner_state = runner_state.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            runner_state.lock().await.running += 1;
            run_job(&pool, &registry, job.id).await;
            decrement_running(&runner_state).await;
        });
    }
    info!("job queue closed, dispatcher stopping");
}

async fn decrement_running(runner_state: &Arc<Mutex<JobRunnerState>>) {
    let mut lock = runner_state.lock().await;
    lock.running = lock.running.saturating_sub(1);
}

/// Re-enqueues jobs left QUEUED by a previous run of the service.
pub async fn resume_queued(pool: &SqlitePool, queue: &mpsc::Sender<QueuedJob>) -> anyhow::Result<usize> {
    let mut conn = pool.acquire().await?;
    let ids = db::queued_job_ids(&mut conn).await?;
    for id in &ids {
        queue.send(QueuedJob { id: *id }).await?;
    }
    if !ids.is_empty() {
        info!(count = ids.len(), "resumed queued jobs");
    }
    Ok(ids.len())
}
