//! Cleanup sweeper: the out-of-band reclaimer for data-artifact tables.
//!
//! An independent long-lived loop with its own state-store engine and its
//! own data-store client. Each pass reads a bounded batch of zero-refcount
//! table names, drops each table (best effort), and deletes the refcount
//! row under a guard that tolerates a racing incref. Because the
//! distributed lifecycle handler only writes deltas and never drops, and
//! the sweeper only drops after observing a non-positive count, no worker
//! ever sees a dropped table while still holding a reference.

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aaiclick_db::config::DbConfig;
use aaiclick_db::pool::create_pool;
use aaiclick_db::queries::{refcounts, workers};

use crate::data::{ChClient, ChConfig};
use crate::params::is_artifact_table_name;

/// Sweeper tuning.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sleep between passes.
    pub interval: Duration,
    /// Maximum candidates per pass.
    pub batch: i64,
    /// Workers whose heartbeat is older than this are marked STOPPED.
    pub stale_worker_threshold: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch: 100,
            stale_worker_threshold: Duration::from_secs(300),
        }
    }
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Candidates read from the refcount table.
    pub scanned: usize,
    /// Refcount rows actually deleted (count still non-positive).
    pub reclaimed: usize,
}

/// One sweep pass. Idempotent: passes over a static store converge after
/// the first, and a crash mid-batch leaves retryable rows (drops are
/// idempotent too).
pub async fn sweep_once(pool: &PgPool, client: &ChClient, batch: i64) -> Result<SweepStats> {
    let candidates = refcounts::zero_candidates(pool, batch).await?;
    let mut stats = SweepStats {
        scanned: candidates.len(),
        reclaimed: 0,
    };

    for table_name in &candidates {
        if !is_artifact_table_name(table_name) {
            warn!(table = %table_name, "skipping non-artifact refcount row");
            continue;
        }

        // Best effort: the table may already be gone, or the data store may
        // be briefly unreachable. Either way the row is retried next pass
        // unless the guarded delete below succeeds.
        if let Err(e) = client
            .execute(&format!("DROP TABLE IF EXISTS {table_name}"))
            .await
        {
            debug!(table = %table_name, error = %e, "drop failed, will retry");
            continue;
        }

        let deleted = refcounts::delete_if_zero(pool, table_name).await?;
        if deleted > 0 {
            stats.reclaimed += 1;
            debug!(table = %table_name, "reclaimed");
        }
    }

    Ok(stats)
}

/// Run the sweeper until cancelled.
///
/// Builds its own engine and client; shares nothing with workers or orch
/// contexts.
pub async fn run_sweeper(
    db_config: &DbConfig,
    ch_config: &ChConfig,
    config: &SweeperConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let pool = create_pool(db_config).await?;
    let client = ChClient::new(ch_config.clone())?;

    info!(interval_secs = config.interval.as_secs(), batch = config.batch, "sweeper started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match sweep_once(&pool, &client, config.batch).await {
            Ok(stats) if stats.scanned > 0 => {
                info!(scanned = stats.scanned, reclaimed = stats.reclaimed, "sweep pass");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "sweep pass failed"),
        }

        // Stale workers are only marked STOPPED; reclaiming their tasks is
        // a reserved extension.
        match workers::mark_stale_workers(&pool, config.stale_worker_threshold.as_secs() as i64)
            .await
        {
            Ok(marked) if !marked.is_empty() => {
                warn!(workers = ?marked, "marked stale workers STOPPED");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale-worker sweep failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    pool.close().await;
    info!("sweeper stopped");
    Ok(())
}
