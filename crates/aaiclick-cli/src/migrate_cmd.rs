//! `aaiclick migrate` command family: apply, inspect, and target
//! state-store migrations.

use std::borrow::Cow;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::migrate::Migrator;

use aaiclick_db::config::DbConfig;
use aaiclick_db::pool;

/// `aaiclick migrate`: ensure the database exists and apply everything
/// pending.
pub async fn run_migrate(config: &DbConfig) -> Result<()> {
    pool::ensure_database_exists(config).await?;

    let db_pool = pool::create_pool(config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    Ok(())
}

/// `aaiclick migrate current`: print the latest applied revision.
pub async fn run_current(config: &DbConfig) -> Result<()> {
    let db_pool = pool::create_pool(config).await?;

    match applied_migrations(&db_pool).await?.last() {
        Some((version, description, installed_on)) => {
            println!("{version} ({description}), applied {installed_on}");
        }
        None => println!("no migrations applied"),
    }

    db_pool.close().await;
    Ok(())
}

/// `aaiclick migrate history`: print every applied revision in order.
pub async fn run_history(config: &DbConfig) -> Result<()> {
    let db_pool = pool::create_pool(config).await?;

    let applied = applied_migrations(&db_pool).await?;
    if applied.is_empty() {
        println!("no migrations applied");
    }
    for (version, description, installed_on) in &applied {
        println!("{version}  {description}  {installed_on}");
    }

    db_pool.close().await;
    Ok(())
}

/// `aaiclick migrate upgrade <rev>`: apply pending migrations up to and
/// including `rev`.
pub async fn run_upgrade(config: &DbConfig, rev: i64) -> Result<()> {
    pool::ensure_database_exists(config).await?;
    let db_pool = pool::create_pool(config).await?;

    let mut migrator = load_migrator().await?;
    if !migrator.iter().any(|m| m.version == rev) {
        anyhow::bail!("unknown revision {rev}");
    }
    // The runtime migrator exposes its migration list; restricting it is
    // how a targeted upgrade is expressed.
    let filtered: Vec<_> = migrator
        .iter()
        .filter(|m| m.version <= rev)
        .cloned()
        .collect();
    migrator.migrations = Cow::Owned(filtered);

    migrator
        .run(&db_pool)
        .await
        .with_context(|| format!("failed to upgrade to revision {rev}"))?;

    println!("upgraded to {rev}");
    db_pool.close().await;
    Ok(())
}

/// `aaiclick migrate downgrade <rev>`: revert applied migrations down to
/// (and including) everything newer than `rev`.
pub async fn run_downgrade(config: &DbConfig, rev: i64) -> Result<()> {
    let db_pool = pool::create_pool(config).await?;

    let migrator = load_migrator().await?;
    migrator
        .undo(&db_pool, rev)
        .await
        .with_context(|| format!("failed to downgrade to revision {rev}"))?;

    println!("downgraded to {rev}");
    db_pool.close().await;
    Ok(())
}

async fn load_migrator() -> Result<Migrator> {
    Migrator::new(pool::default_migrations_path())
        .await
        .context("failed to load migrations")
}

async fn applied_migrations(db_pool: &PgPool) -> Result<Vec<(i64, String, DateTime<Utc>)>> {
    let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(
        "SELECT version, description, installed_on \
         FROM _sqlx_migrations ORDER BY version",
    )
    .fetch_all(db_pool)
    .await
    .context("failed to read migration history (has `aaiclick migrate` run?)")?;

    Ok(rows)
}
