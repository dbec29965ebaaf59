//! `aaiclick worker` command family.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use aaiclick_core::data::ChConfig;
use aaiclick_core::registry::CallbackRegistry;
use aaiclick_core::worker::{WorkerConfig, run_worker};
use aaiclick_db::config::DbConfig;
use aaiclick_db::models::WorkerStatus;
use aaiclick_db::pool::create_pool;
use aaiclick_db::queries::workers;

/// `aaiclick worker start`: run one worker process until drained or
/// signaled.
///
/// The stock binary registers no callbacks, so it only makes sense against
/// jobs whose entrypoints an embedding binary registered -- or as the
/// orchestration half of a deployment where tasks fail fast on unknown
/// entrypoints. Library users call [`run_worker`] with their own registry.
pub async fn run_worker_start(
    config: &DbConfig,
    registry: Arc<CallbackRegistry>,
    max_tasks: Option<u64>,
) -> Result<()> {
    let pool = create_pool(config).await?;

    let mut worker_config = WorkerConfig::from_env();
    worker_config.max_tasks = max_tasks;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let summary = run_worker(
        &pool,
        config,
        &ChConfig::from_env(),
        registry,
        &worker_config,
        cancel,
    )
    .await?;

    println!(
        "worker {} stopped: {} completed, {} failed",
        summary.worker_id, summary.tasks_completed, summary.tasks_failed
    );

    pool.close().await;
    Ok(())
}

/// `aaiclick worker list`: print workers with status and heartbeat age.
pub async fn run_worker_list(config: &DbConfig) -> Result<()> {
    let pool = create_pool(config).await?;

    let all = workers::list_workers(&pool).await?;
    if all.is_empty() {
        println!("no workers registered");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<20} {:<24} {:>7} {:<8} {:>10} {:>7} {:>7}",
        "ID", "HOST", "PID", "STATUS", "HEARTBEAT", "DONE", "FAILED"
    );
    let now = chrono::Utc::now();
    for worker in &all {
        let age = now.signed_duration_since(worker.last_heartbeat);
        let heartbeat = match worker.status {
            WorkerStatus::Stopped => "-".to_owned(),
            _ => format!("{}s ago", age.num_seconds().max(0)),
        };
        println!(
            "{:<20} {:<24} {:>7} {:<8} {:>10} {:>7} {:>7}",
            worker.id,
            worker.hostname,
            worker.pid,
            worker.status.to_string(),
            heartbeat,
            worker.tasks_completed,
            worker.tasks_failed
        );
    }

    pool.close().await;
    Ok(())
}
