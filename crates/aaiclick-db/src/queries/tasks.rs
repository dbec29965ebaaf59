//! Database query functions for the `tasks` table, including the atomic
//! claim protocol.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Task;

/// Insert a new task row.
///
/// Takes any executor so `apply` can run it inside a transaction. Idempotent:
/// re-presenting an already-persisted task with the same ID is a no-op.
pub async fn insert_task<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    id: i64,
    job_id: i64,
    group_id: Option<i64>,
    entrypoint: &str,
    kwargs: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tasks (id, job_id, group_id, entrypoint, kwargs) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(job_id)
    .bind(group_id)
    .bind(entrypoint)
    .bind(kwargs)
    .execute(executor)
    .await
    .context("failed to insert task")?;

    Ok(())
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a given job, in creation (snowflake) order.
pub async fn list_tasks_for_job(pool: &PgPool, job_id: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE job_id = $1 ORDER BY id ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await
        .context("failed to list tasks for job")?;

    Ok(tasks)
}

/// The claim protocol: atomically draw one ready task for a worker.
///
/// A single statement, one round trip. The `ready` CTE selects one PENDING
/// task whose dependency predicate holds, locking the row with
/// `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the same task.
/// The predicate covers all four edge kinds:
///
/// - direct edges onto the task: a `task` predecessor must be COMPLETED, a
///   `group` predecessor must have every member task COMPLETED (vacuously
///   true for an empty group);
/// - edges onto the task's owning group, with the same two predecessor rules.
///
/// Candidates are ordered by owning-job `started_at` (nulls last, so
/// already-running jobs drain before new ones start), then by task ID
/// (snowflake order, i.e. creation order). The `claimed` CTE transitions the
/// row PENDING -> CLAIMED, and `armed` arms the owning job in the same
/// statement: `started_at` is set exactly once, together with the job's
/// PENDING -> RUNNING transition.
///
/// Returns `None` when nothing is ready; the caller backs off and retries.
pub async fn claim_next_task(pool: &PgPool, worker_id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        r#"
        WITH ready AS (
            SELECT t.id, t.job_id
            FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE t.status = 'PENDING'
              AND NOT EXISTS (
                  SELECT 1 FROM dependencies d
                  WHERE d.next_id = t.id AND d.next_type = 'task'
                    AND ((d.previous_type = 'task' AND EXISTS (
                              SELECT 1 FROM tasks p
                              WHERE p.id = d.previous_id AND p.status <> 'COMPLETED'))
                      OR (d.previous_type = 'group' AND EXISTS (
                              SELECT 1 FROM tasks p
                              WHERE p.group_id = d.previous_id AND p.status <> 'COMPLETED')))
              )
              AND (t.group_id IS NULL OR NOT EXISTS (
                  SELECT 1 FROM dependencies d
                  WHERE d.next_id = t.group_id AND d.next_type = 'group'
                    AND ((d.previous_type = 'task' AND EXISTS (
                              SELECT 1 FROM tasks p
                              WHERE p.id = d.previous_id AND p.status <> 'COMPLETED'))
                      OR (d.previous_type = 'group' AND EXISTS (
                              SELECT 1 FROM tasks p
                              WHERE p.group_id = d.previous_id AND p.status <> 'COMPLETED')))
              ))
            ORDER BY j.started_at ASC NULLS LAST, t.id ASC
            LIMIT 1
            FOR UPDATE OF t SKIP LOCKED
        ),
        claimed AS (
            UPDATE tasks t
            SET status = 'CLAIMED', worker_id = $1, claimed_at = NOW()
            FROM ready r
            WHERE t.id = r.id
            RETURNING t.*
        ),
        armed AS (
            UPDATE jobs j
            SET started_at = COALESCE(j.started_at, NOW()),
                status = CASE WHEN j.started_at IS NULL THEN 'RUNNING' ELSE j.status END
            FROM claimed c
            WHERE j.id = c.job_id
        )
        SELECT * FROM claimed
        "#,
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("failed to claim next task")?;

    Ok(task)
}

/// Claim a specific task without a worker, for the single-process debug
/// runner (no locking needed there).
pub async fn claim_for_runner(pool: &PgPool, id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'CLAIMED', claimed_at = NOW() \
         WHERE id = $1 AND status = 'PENDING'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to claim task for runner")?;

    Ok(result.rows_affected())
}

/// Transition a claimed task to RUNNING and record its log path.
pub async fn mark_running(pool: &PgPool, id: i64, log_path: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'RUNNING', started_at = NOW(), log_path = $2 \
         WHERE id = $1 AND status = 'CLAIMED'",
    )
    .bind(id)
    .bind(log_path)
    .execute(pool)
    .await
    .context("failed to mark task running")?;

    Ok(result.rows_affected())
}

/// Record a successful task: COMPLETED with its result reference (or NULL).
///
/// Guarded on non-terminal status, so a terminal task is never mutated again
/// and double-completion is a no-op.
pub async fn mark_completed(
    pool: &PgPool,
    id: i64,
    result_ref: Option<&serde_json::Value>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'COMPLETED', result = $2, completed_at = NOW() \
         WHERE id = $1 AND status IN ('CLAIMED', 'RUNNING')",
    )
    .bind(id)
    .bind(result_ref)
    .execute(pool)
    .await
    .context("failed to mark task completed")?;

    Ok(result.rows_affected())
}

/// Record a failed task: FAILED with its stringified error.
///
/// Same terminal-monotonicity guard as [`mark_completed`].
pub async fn mark_failed(pool: &PgPool, id: i64, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'FAILED', error = $2, completed_at = NOW() \
         WHERE id = $1 AND status IN ('CLAIMED', 'RUNNING')",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

