//! Database query functions for the `dependencies` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{DepKind, Dependency};

/// Insert a dependency edge: `next` runs only after `previous` completes.
///
/// Takes any executor so `apply` can run it inside a transaction. Uses
/// `ON CONFLICT DO NOTHING` so re-applying a graph fragment never duplicates
/// edges.
pub async fn insert_dependency<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    previous_id: i64,
    previous_type: DepKind,
    next_id: i64,
    next_type: DepKind,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO dependencies (previous_id, previous_type, next_id, next_type) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT DO NOTHING",
    )
    .bind(previous_id)
    .bind(previous_type)
    .bind(next_id)
    .bind(next_type)
    .execute(executor)
    .await
    .context("failed to insert dependency")?;

    Ok(())
}

/// List the edges pointing at a given node.
pub async fn list_for_next(
    pool: &PgPool,
    next_id: i64,
    next_type: DepKind,
) -> Result<Vec<Dependency>> {
    let deps = sqlx::query_as::<_, Dependency>(
        "SELECT * FROM dependencies WHERE next_id = $1 AND next_type = $2",
    )
    .bind(next_id)
    .bind(next_type)
    .fetch_all(pool)
    .await
    .context("failed to list dependencies for node")?;

    Ok(deps)
}

/// List every dependency edge whose `next` side belongs to the given job
/// (either one of its tasks or one of its groups).
///
/// The debug runner evaluates the readiness predicate in memory over this
/// set.
pub async fn list_for_job(pool: &PgPool, job_id: i64) -> Result<Vec<Dependency>> {
    let deps = sqlx::query_as::<_, Dependency>(
        "SELECT d.* FROM dependencies d \
         WHERE (d.next_type = 'task' \
                AND d.next_id IN (SELECT id FROM tasks WHERE job_id = $1)) \
            OR (d.next_type = 'group' \
                AND d.next_id IN (SELECT id FROM groups WHERE job_id = $1))",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list dependencies for job")?;

    Ok(deps)
}

/// Count all dependency edges attached to a job's tasks and groups.
pub async fn count_for_job(pool: &PgPool, job_id: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM dependencies d \
         WHERE (d.next_type = 'task' \
                AND d.next_id IN (SELECT id FROM tasks WHERE job_id = $1)) \
            OR (d.next_type = 'group' \
                AND d.next_id IN (SELECT id FROM groups WHERE job_id = $1))",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .context("failed to count dependencies for job")?;

    Ok(row.0)
}
