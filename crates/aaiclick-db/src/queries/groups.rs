//! Database query functions for the `groups` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Group;

/// Insert a new group row.
///
/// Takes any executor so `apply` can run it inside a transaction. Idempotent
/// on conflict, like task insertion.
pub async fn insert_group<'e, E: sqlx::PgExecutor<'e>>(
    executor: E,
    id: i64,
    job_id: i64,
    parent_group_id: Option<i64>,
    name: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO groups (id, job_id, parent_group_id, name) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(job_id)
    .bind(parent_group_id)
    .bind(name)
    .execute(executor)
    .await
    .context("failed to insert group")?;

    Ok(())
}

/// List all groups for a given job, in creation (snowflake) order.
pub async fn list_groups_for_job(pool: &PgPool, job_id: i64) -> Result<Vec<Group>> {
    let groups =
        sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE job_id = $1 ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(pool)
            .await
            .context("failed to list groups for job")?;

    Ok(groups)
}
