//! Disposable PostgreSQL databases for aaiclick integration tests.
//!
//! One server is shared per test binary: an external instance named by
//! `AAICLICK_TEST_PG_URL` when set (nextest setup script), otherwise a
//! testcontainers instance started on first use and kept alive for the
//! binary's lifetime. Every test carves its own uniquely-named, migrated
//! database out of that server via [`TestDb`].

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use aaiclick_db::config::DbConfig;
use aaiclick_db::pool;

/// The binary-wide server: its root URL (no database path) and, when we
/// started it ourselves, the container handle that keeps it alive.
struct PgServer {
    root_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

impl PgServer {
    async fn get() -> &'static PgServer {
        SERVER
            .get_or_init(|| async {
                if let Ok(url) = std::env::var("AAICLICK_TEST_PG_URL") {
                    return PgServer {
                        root_url: url,
                        _container: None,
                    };
                }

                let container = Postgres::default()
                    .with_tag("18")
                    .start()
                    .await
                    .expect("failed to start PostgreSQL container");
                let host = container.get_host().await.expect("container host");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("container port");

                PgServer {
                    root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                    _container: Some(container),
                }
            })
            .await
    }

    /// Short-lived single-connection pool on the `postgres` maintenance
    /// database, for CREATE/DROP DATABASE.
    async fn admin(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/postgres", self.root_url))
            .await
            .expect("failed to connect to maintenance database")
    }

    async fn run_admin(&self, statement: &str) {
        let admin = self.admin().await;
        admin
            .execute(statement)
            .await
            .unwrap_or_else(|e| panic!("admin statement failed ({statement}): {e}"));
        admin.close().await;
    }
}

/// One disposable database with migrations applied.
///
/// Tests hold it for their lifetime and call [`TestDb::teardown`] at the
/// end; the database name is unique per instance, so tests are fully
/// isolated from each other.
pub struct TestDb {
    pool: PgPool,
    url: String,
    name: String,
}

impl TestDb {
    pub async fn new() -> Self {
        let server = PgServer::get().await;
        let name = format!("aaiclick_test_{}", Uuid::new_v4().simple());
        server.run_admin(&format!("CREATE DATABASE {name}")).await;

        let url = format!("{}/{name}", server.root_url);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {name}: {e}"));

        pool::run_migrations(&pool, pool::default_migrations_path())
            .await
            .expect("migrations should succeed");

        Self { pool, url, name }
    }

    /// The pool on this database. `PgPool` is cheap to clone.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A state-store config pointing at this database, for components that
    /// build their own engine (workers, lifecycle handlers, the sweeper).
    pub fn config(&self) -> DbConfig {
        DbConfig::new(self.url.clone())
    }

    /// Close the pool and drop the database.
    ///
    /// Lingering connections (a handler engine that has not fully wound
    /// down, say) are terminated first, and the drop itself is best-effort.
    pub async fn teardown(self) {
        self.pool.close().await;

        let server = PgServer::get().await;
        let admin = server.admin().await;
        let _ = admin
            .execute(
                format!(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE datname = '{}' AND pid <> pg_backend_pid()",
                    self.name
                )
                .as_str(),
            )
            .await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        admin.close().await;
    }
}
