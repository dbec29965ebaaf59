//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Worker, WorkerStatus};

/// Register a worker process: insert its row as ACTIVE with a fresh
/// heartbeat.
pub async fn register_worker(pool: &PgPool, id: i64, hostname: &str, pid: i32) -> Result<Worker> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, hostname, pid) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(id)
    .bind(hostname)
    .bind(pid)
    .fetch_one(pool)
    .await
    .context("failed to register worker")?;

    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, id: i64) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")?;

    Ok(worker)
}

/// List all workers, most recently started first.
pub async fn list_workers(pool: &PgPool) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY started_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list workers")?;

    Ok(workers)
}

/// Refresh a worker's heartbeat and set its status.
pub async fn heartbeat(pool: &PgPool, id: i64, status: WorkerStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE workers SET last_heartbeat = NOW(), status = $2 \
         WHERE id = $1 AND status <> 'STOPPED'",
    )
    .bind(id)
    .bind(status)
    .execute(pool)
    .await
    .context("failed to update worker heartbeat")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("worker {id} not found or already stopped");
    }

    Ok(())
}

/// Increment the worker's completed or failed task counter.
pub async fn record_task_result(pool: &PgPool, id: i64, success: bool) -> Result<()> {
    let sql = if success {
        "UPDATE workers SET tasks_completed = tasks_completed + 1 WHERE id = $1"
    } else {
        "UPDATE workers SET tasks_failed = tasks_failed + 1 WHERE id = $1"
    };

    sqlx::query(sql)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to record worker task result")?;

    Ok(())
}

/// Mark a worker STOPPED on clean shutdown. Idempotent.
pub async fn mark_stopped(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("UPDATE workers SET status = 'STOPPED', last_heartbeat = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark worker stopped")?;

    Ok(())
}

/// Mark every worker whose heartbeat is older than `threshold_secs` STOPPED.
///
/// Tasks the stale worker still holds are left in place; reclaiming them
/// back to PENDING is a reserved extension.
///
/// Returns the IDs of the workers that were marked.
pub async fn mark_stale_workers(pool: &PgPool, threshold_secs: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "UPDATE workers SET status = 'STOPPED' \
         WHERE status <> 'STOPPED' \
           AND last_heartbeat < NOW() - make_interval(secs => $1::double precision) \
         RETURNING id",
    )
    .bind(threshold_secs)
    .fetch_all(pool)
    .await
    .context("failed to mark stale workers")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
