//! Async ClickHouse client over the HTTP interface.
//!
//! The orchestration core only ever sends opaque SQL text: `CREATE TABLE …
//! ENGINE = MergeTree`, `INSERT`, `DROP TABLE IF EXISTS`, and `SELECT`.
//! Reads use `FORMAT JSONEachRow` so rows come back as JSON objects.

use anyhow::{Context, Result};

use super::config::ChConfig;

/// A ClickHouse client handle. Cheap to clone; the underlying reqwest
/// client pools connections at process level.
#[derive(Debug, Clone)]
pub struct ChClient {
    http: reqwest::Client,
    config: ChConfig,
}

impl ChClient {
    /// Build a client for the given endpoint. No connection is made until
    /// the first statement is sent.
    pub fn new(config: ChConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build data-store HTTP client")?;
        Ok(Self { http, config })
    }

    /// Execute a statement, discarding any response body.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.send(sql).await?;
        Ok(())
    }

    /// Run a `SELECT`, returning one JSON object per row.
    ///
    /// Appends `FORMAT JSONEachRow` to the statement.
    pub async fn query_rows(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let body = self.send(&format!("{sql} FORMAT JSONEachRow")).await?;
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("malformed data-store row: {line}"))
            })
            .collect()
    }

    async fn send(&self, sql: &str) -> Result<String> {
        let response = self
            .http
            .post(self.config.endpoint())
            .query(&[("database", self.config.database.as_str())])
            .basic_auth(
                &self.config.user,
                (!self.config.password.is_empty()).then_some(&self.config.password),
            )
            .body(sql.to_owned())
            .send()
            .await
            .with_context(|| format!("data-store request failed: {}", self.config.endpoint()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read data-store response")?;

        if !status.is_success() {
            anyhow::bail!("data-store statement failed ({status}): {body}");
        }

        Ok(body)
    }
}
