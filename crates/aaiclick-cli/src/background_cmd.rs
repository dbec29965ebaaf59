//! `aaiclick background` command family: the cleanup sweeper.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use aaiclick_core::data::ChConfig;
use aaiclick_core::sweeper::{SweeperConfig, run_sweeper};
use aaiclick_db::config::DbConfig;

/// `aaiclick background start`: run the cleanup sweeper until signaled.
pub async fn run_background_start(
    config: &DbConfig,
    interval_secs: u64,
    batch: i64,
) -> Result<()> {
    let sweeper_config = SweeperConfig {
        interval: Duration::from_secs(interval_secs),
        batch,
        ..SweeperConfig::default()
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    run_sweeper(config, &ChConfig::from_env(), &sweeper_config, cancel).await
}
