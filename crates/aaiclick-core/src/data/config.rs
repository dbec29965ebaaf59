use std::env;

/// Data-store (ClickHouse) configuration.
///
/// Read from the `CLICKHOUSE_*` environment variables. The core drives
/// ClickHouse through its HTTP interface, so this boils down to an endpoint
/// URL plus credentials.
#[derive(Debug, Clone)]
pub struct ChConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ChConfig {
    /// Build a config from the environment.
    ///
    /// Reads `CLICKHOUSE_HOST`, `CLICKHOUSE_PORT`, `CLICKHOUSE_USER`,
    /// `CLICKHOUSE_PASSWORD`, and `CLICKHOUSE_DB` (defaults: localhost,
    /// 8123, `default`, empty, `default`).
    pub fn from_env() -> Self {
        Self {
            host: env::var("CLICKHOUSE_HOST").unwrap_or_else(|_| "localhost".to_owned()),
            port: env::var("CLICKHOUSE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8123),
            user: env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_owned()),
            password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            database: env::var("CLICKHOUSE_DB").unwrap_or_else(|_| "default".to_owned()),
        }
    }

    /// The HTTP endpoint queries are POSTed to.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

impl Default for ChConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
