//! Database query functions for the `refcounts` table.
//!
//! The distributed lifecycle handler writes deltas here; the cleanup sweeper
//! reads candidates and deletes rows once the backing table is gone. Neither
//! side ever blocks on the other.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Refcount;

/// Increment the refcount for a table, creating the row at 1 if absent.
pub async fn incref(pool: &PgPool, table_name: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO refcounts (table_name, count) VALUES ($1, 1) \
         ON CONFLICT (table_name) DO UPDATE SET count = refcounts.count + 1",
    )
    .bind(table_name)
    .execute(pool)
    .await
    .context("failed to increment refcount")?;

    Ok(())
}

/// Decrement the refcount for a table, creating the row at -1 if absent
/// (a decref can race ahead of the matching incref's durable write).
pub async fn decref(pool: &PgPool, table_name: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO refcounts (table_name, count) VALUES ($1, -1) \
         ON CONFLICT (table_name) DO UPDATE SET count = refcounts.count - 1",
    )
    .bind(table_name)
    .execute(pool)
    .await
    .context("failed to decrement refcount")?;

    Ok(())
}

/// Fetch the refcount row for a table.
pub async fn get(pool: &PgPool, table_name: &str) -> Result<Option<Refcount>> {
    let row = sqlx::query_as::<_, Refcount>("SELECT * FROM refcounts WHERE table_name = $1")
        .bind(table_name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch refcount")?;

    Ok(row)
}

/// Select up to `batch` table names whose refcount has dropped to zero or
/// below -- the sweeper's drop candidates.
pub async fn zero_candidates(pool: &PgPool, batch: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name FROM refcounts WHERE count <= 0 ORDER BY table_name LIMIT $1",
    )
    .bind(batch)
    .fetch_all(pool)
    .await
    .context("failed to select zero-refcount candidates")?;

    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Delete a refcount row, but only while its count is still non-positive.
///
/// The predicate guards against a racing incref that lifted the count back
/// positive between the sweeper's read and this delete.
pub async fn delete_if_zero(pool: &PgPool, table_name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM refcounts WHERE table_name = $1 AND count <= 0")
        .bind(table_name)
        .execute(pool)
        .await
        .context("failed to delete refcount row")?;

    Ok(result.rows_affected())
}
