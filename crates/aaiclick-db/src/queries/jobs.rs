//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Job, JobStatus};

/// Insert a new job row with a client-generated snowflake ID.
///
/// Idempotent: re-presenting an already-persisted job with the same ID is a
/// no-op, and the stored row is returned either way.
pub async fn insert_job(pool: &PgPool, id: i64, name: &str) -> Result<Job> {
    sqlx::query("INSERT INTO jobs (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .context("failed to insert job")?;

    get_job(pool, id)
        .await?
        .with_context(|| format!("job {id} vanished after insert"))
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: i64) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// Arm a job: set `started_at` if unset and move PENDING -> RUNNING.
///
/// The distributed claim protocol arms jobs inline; this standalone form is
/// used by the single-process debug runner. Idempotent.
pub async fn arm_job(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs \
         SET started_at = COALESCE(started_at, NOW()), \
             status = CASE WHEN started_at IS NULL THEN 'RUNNING' ELSE status END \
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to arm job")?;

    Ok(())
}

/// Status counts for a job's tasks.
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    pub pending: i64,
    pub claimed: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given job.
pub async fn job_progress(pool: &PgPool, job_id: i64) -> Result<JobProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE job_id = $1 \
         GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to get job progress")?;

    let mut progress = JobProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "PENDING" => progress.pending = *count,
            "CLAIMED" => progress.claimed = *count,
            "RUNNING" => progress.running = *count,
            "COMPLETED" => progress.completed = *count,
            "FAILED" => progress.failed = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Write the job's terminal status if every one of its tasks is terminal.
///
/// COMPLETED iff every task is COMPLETED, FAILED otherwise. The guard on the
/// job's own status makes the check idempotent under concurrent workers: a
/// job that is already terminal is never re-terminalized, and a job with
/// zero tasks is never touched.
///
/// Returns the terminal status written, or `None` if the job was not (or was
/// already) finalized.
pub async fn finalize_if_terminal(pool: &PgPool, job_id: i64) -> Result<Option<JobStatus>> {
    let row: Option<(JobStatus,)> = sqlx::query_as(
        "UPDATE jobs j \
         SET status = CASE \
                 WHEN EXISTS (SELECT 1 FROM tasks t \
                              WHERE t.job_id = j.id AND t.status = 'FAILED') \
                 THEN 'FAILED' ELSE 'COMPLETED' END, \
             completed_at = NOW() \
         WHERE j.id = $1 \
           AND j.status NOT IN ('COMPLETED', 'FAILED') \
           AND EXISTS (SELECT 1 FROM tasks t WHERE t.job_id = j.id) \
           AND NOT EXISTS (SELECT 1 FROM tasks t \
                           WHERE t.job_id = j.id \
                             AND t.status NOT IN ('COMPLETED', 'FAILED')) \
         RETURNING j.status",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .context("failed to finalize job")?;

    Ok(row.map(|(status,)| status))
}
