//! The worker loop: register, claim, execute, record, heartbeat.
//!
//! Workers coordinate exclusively through the state store; there is no RPC
//! between them. A worker owns one [`DistributedLifecycle`] handler for the
//! whole loop so table references taken during task execution land in the
//! `refcounts` table and the out-of-band sweeper reclaims storage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aaiclick_db::config::DbConfig;
use aaiclick_db::models::WorkerStatus;
use aaiclick_db::queries::{jobs, tasks, workers};

use crate::data::ChConfig;
use crate::executor::{TaskOutcome, execute_claimed_task};
use crate::lifecycle::{DistributedLifecycle, LifecycleHandler};
use crate::registry::CallbackRegistry;
use crate::snowflake;

/// Worker tuning, mostly from `WORKER_*` environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Seconds between heartbeat writes.
    pub heartbeat_interval: Duration,
    /// Initial sleep after an empty poll; doubles up to
    /// [`Self::max_poll_interval`].
    pub poll_interval: Duration,
    /// Upper bound for the empty-poll backoff.
    pub max_poll_interval: Duration,
    /// Exit after this many executed tasks (tests and bounded runs).
    pub max_tasks: Option<u64>,
    /// Exit after this many consecutive empty polls.
    pub max_empty_polls: Option<u64>,
    /// Reserved: per-task wall-time limit. Read from the environment but
    /// consumed by nothing yet.
    pub task_timeout: Option<Duration>,
    /// Reserved: automatic retry count. Read but unconsumed.
    pub max_retries: Option<u32>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let seconds = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
        };

        Self {
            heartbeat_interval: Duration::from_secs(
                seconds("WORKER_HEARTBEAT_INTERVAL").unwrap_or(15),
            ),
            poll_interval: Duration::from_millis(200),
            max_poll_interval: Duration::from_secs(2),
            max_tasks: None,
            max_empty_polls: None,
            task_timeout: seconds("WORKER_TASK_TIMEOUT").map(Duration::from_secs),
            max_retries: std::env::var("WORKER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// What a finished worker reports back.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub worker_id: i64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Run one worker until cancellation, `max_tasks`, or `max_empty_polls`.
///
/// The loop never crashes on a task failure: callback errors are recorded
/// as FAILED tasks and the worker moves on. On exit the worker row is
/// marked STOPPED and the owned lifecycle handler is drained.
pub async fn run_worker(
    pool: &PgPool,
    db_config: &DbConfig,
    ch_config: &ChConfig,
    registry: Arc<CallbackRegistry>,
    config: &WorkerConfig,
    cancel: CancellationToken,
) -> Result<WorkerSummary> {
    let worker_id = snowflake::get_snowflake_id()?;
    workers::register_worker(pool, worker_id, &hostname(), std::process::id() as i32)
        .await
        .context("failed to register worker")?;

    info!(worker_id, "worker registered");

    // The handler outlives every task's data context, so refcount deltas
    // from late drops still drain before shutdown.
    let lifecycle: Arc<dyn LifecycleHandler> =
        Arc::new(DistributedLifecycle::new(db_config.clone()));
    lifecycle.start();

    // Transient state-store errors are retried a bounded number of times
    // before surfacing.
    const MAX_CLAIM_ERRORS: u32 = 5;

    let mut completed: u64 = 0;
    let mut failed: u64 = 0;
    let mut empty_polls: u64 = 0;
    let mut claim_errors: u32 = 0;
    let mut backoff = config.poll_interval;
    let mut last_heartbeat = tokio::time::Instant::now();

    loop {
        if cancel.is_cancelled() {
            info!(worker_id, "worker cancelled, draining");
            break;
        }

        match tasks::claim_next_task(pool, worker_id).await {
            Ok(Some(task)) => {
                empty_polls = 0;
                claim_errors = 0;
                backoff = config.poll_interval;

                info!(
                    worker_id,
                    task_id = task.id,
                    job_id = task.job_id,
                    entrypoint = %task.entrypoint,
                    "claimed task"
                );

                let outcome = execute_claimed_task(
                    pool,
                    &registry,
                    ch_config,
                    Some(Arc::clone(&lifecycle)),
                    &task,
                )
                .await;

                match outcome {
                    Ok(TaskOutcome::Completed { result }) => {
                        tasks::mark_completed(pool, task.id, result.as_ref()).await?;
                        workers::record_task_result(pool, worker_id, true).await?;
                        completed += 1;
                    }
                    Ok(TaskOutcome::Failed { error: message }) => {
                        warn!(worker_id, task_id = task.id, error = %message, "task failed");
                        tasks::mark_failed(pool, task.id, &message).await?;
                        workers::record_task_result(pool, worker_id, false).await?;
                        failed += 1;
                    }
                    Err(e) => {
                        // Infrastructure failure around the execution path;
                        // the task still terminalizes so the job can finish.
                        error!(worker_id, task_id = task.id, error = %e, "execution error");
                        let _ = tasks::mark_failed(pool, task.id, &format!("{e:#}")).await;
                        let _ = workers::record_task_result(pool, worker_id, false).await;
                        failed += 1;
                    }
                }

                // Best-effort, racey across workers, idempotent: a job that
                // is already terminal is never re-terminalized.
                if let Some(status) = jobs::finalize_if_terminal(pool, task.job_id).await? {
                    info!(worker_id, job_id = task.job_id, status = %status, "job finalized");
                }

                if let Some(max_tasks) = config.max_tasks {
                    if completed + failed >= max_tasks {
                        info!(worker_id, max_tasks, "reached max tasks, stopping");
                        break;
                    }
                }
            }
            Ok(None) => {
                empty_polls += 1;
                claim_errors = 0;
                if let Some(max_empty) = config.max_empty_polls {
                    if empty_polls >= max_empty {
                        info!(worker_id, empty_polls, "queue drained, stopping");
                        break;
                    }
                }

                if last_heartbeat.elapsed() >= config.heartbeat_interval {
                    workers::heartbeat(pool, worker_id, WorkerStatus::Idle).await?;
                    last_heartbeat = tokio::time::Instant::now();
                }

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(config.max_poll_interval);
                continue;
            }
            Err(e) => {
                // Claim contention is not an error; this is a transport
                // failure. Retry with backoff a bounded number of times,
                // then surface.
                claim_errors += 1;
                if claim_errors >= MAX_CLAIM_ERRORS {
                    let _ = workers::mark_stopped(pool, worker_id).await;
                    lifecycle.stop();
                    return Err(e.context("state store unreachable, giving up"));
                }
                warn!(worker_id, error = %e, attempt = claim_errors, "claim failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(config.max_poll_interval);
                continue;
            }
        }

        if last_heartbeat.elapsed() >= config.heartbeat_interval {
            workers::heartbeat(pool, worker_id, WorkerStatus::Active).await?;
            last_heartbeat = tokio::time::Instant::now();
        }
    }

    workers::mark_stopped(pool, worker_id).await?;
    lifecycle.stop();

    info!(worker_id, completed, failed, "worker stopped");

    Ok(WorkerSummary {
        worker_id,
        tasks_completed: completed,
        tasks_failed: failed,
    })
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
