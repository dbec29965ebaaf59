mod background_cmd;
mod migrate_cmd;
mod worker_cmd;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use aaiclick_core::registry::CallbackRegistry;
use aaiclick_db::config::DbConfig;

#[derive(Parser)]
#[command(name = "aaiclick", about = "Distributed DAG task orchestration engine")]
struct Cli {
    /// Database URL (overrides the POSTGRES_* env vars)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply state-store migrations (or inspect/target them)
    Migrate {
        #[command(subcommand)]
        command: Option<MigrateCommands>,
    },
    /// Worker process management
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Background maintenance processes
    Background {
        #[command(subcommand)]
        command: BackgroundCommands,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Show the latest applied revision
    Current,
    /// Show every applied revision
    History,
    /// Apply pending migrations up to a revision
    Upgrade {
        /// Target revision
        rev: i64,
    },
    /// Revert applied migrations down to a revision
    Downgrade {
        /// Target revision
        rev: i64,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Start one worker process
    Start {
        /// Stop after executing this many tasks
        #[arg(long)]
        max_tasks: Option<u64>,
    },
    /// Print workers with status and last heartbeat
    List,
}

#[derive(Subcommand)]
enum BackgroundCommands {
    /// Run the cleanup sweeper until signaled
    Start {
        /// Seconds between sweep passes
        #[arg(long, default_value_t = 30)]
        interval: u64,
        /// Maximum tables reclaimed per pass
        #[arg(long, default_value_t = 100)]
        batch: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let db_config = match &cli.database_url {
        Some(url) => DbConfig::new(url.clone()),
        None => DbConfig::from_env(),
    };

    match cli.command {
        Commands::Migrate { command: None } => migrate_cmd::run_migrate(&db_config).await?,
        Commands::Migrate {
            command: Some(MigrateCommands::Current),
        } => migrate_cmd::run_current(&db_config).await?,
        Commands::Migrate {
            command: Some(MigrateCommands::History),
        } => migrate_cmd::run_history(&db_config).await?,
        Commands::Migrate {
            command: Some(MigrateCommands::Upgrade { rev }),
        } => migrate_cmd::run_upgrade(&db_config, rev).await?,
        Commands::Migrate {
            command: Some(MigrateCommands::Downgrade { rev }),
        } => migrate_cmd::run_downgrade(&db_config, rev).await?,
        Commands::Worker {
            command: WorkerCommands::Start { max_tasks },
        } => {
            // The stock binary ships no callbacks; embedders register theirs
            // and call run_worker directly.
            let registry = Arc::new(CallbackRegistry::new());
            worker_cmd::run_worker_start(&db_config, registry, max_tasks).await?;
        }
        Commands::Worker {
            command: WorkerCommands::List,
        } => worker_cmd::run_worker_list(&db_config).await?,
        Commands::Background {
            command: BackgroundCommands::Start { interval, batch },
        } => background_cmd::run_background_start(&db_config, interval, batch).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_worker_start_with_max_tasks() {
        let cli = Cli::try_parse_from(["aaiclick", "worker", "start", "--max-tasks", "5"]).unwrap();
        match cli.command {
            Commands::Worker {
                command: WorkerCommands::Start { max_tasks },
            } => assert_eq!(max_tasks, Some(5)),
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parses_bare_migrate() {
        let cli = Cli::try_parse_from(["aaiclick", "migrate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Migrate { command: None }
        ));
    }

    #[test]
    fn parses_migrate_downgrade_rev() {
        let cli =
            Cli::try_parse_from(["aaiclick", "migrate", "downgrade", "20250801000001"]).unwrap();
        match cli.command {
            Commands::Migrate {
                command: Some(MigrateCommands::Downgrade { rev }),
            } => assert_eq!(rev, 20250801000001),
            _ => panic!("wrong command parsed"),
        }
    }
}
