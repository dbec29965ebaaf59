//! Data-plane context: the scoped handle that owns a ClickHouse client and a
//! lifecycle handler.
//!
//! A context is entered with [`DataContext::scope`], which installs it in a
//! per-async-task ambient slot for the duration of the wrapped future so
//! operators can reach the active client without explicit plumbing. On exit
//! the context goes stale -- any further use of it or of objects registered
//! under it fails with [`StaleObject`] -- and a handler the context owns is
//! stopped (draining its queue).

mod client;
mod config;
mod object;

pub use client::ChClient;
pub use config::ChConfig;
pub use object::{Object, View, concat};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::error::StaleObject;
use crate::lifecycle::{LifecycleHandler, LocalLifecycle};
use crate::snowflake;

tokio::task_local! {
    static CURRENT: DataContext;
}

struct DataContextInner {
    client: ChClient,
    lifecycle: Arc<dyn LifecycleHandler>,
    owns_handler: bool,
    stale: AtomicBool,
}

/// A scoped data-plane handle. Cheap to clone; all clones share staleness.
#[derive(Clone)]
pub struct DataContext {
    inner: Arc<DataContextInner>,
}

impl DataContext {
    /// Build a context over the given data store.
    ///
    /// When `lifecycle` is `None` a [`LocalLifecycle`] is created and owned
    /// by the context (and stopped when the scope exits); an injected
    /// handler is started but left running on exit, since it may be shared
    /// across many contexts. No connection is made here.
    pub fn new(config: ChConfig, lifecycle: Option<Arc<dyn LifecycleHandler>>) -> Result<Self> {
        let (lifecycle, owns_handler) = match lifecycle {
            Some(handler) => (handler, false),
            None => (
                Arc::new(LocalLifecycle::new(config.clone())) as Arc<dyn LifecycleHandler>,
                true,
            ),
        };
        lifecycle.start();

        Ok(Self {
            inner: Arc::new(DataContextInner {
                client: ChClient::new(config)?,
                lifecycle,
                owns_handler,
                stale: AtomicBool::new(false),
            }),
        })
    }

    /// Run a future with this context installed as the ambient data context
    /// of the current async task, then exit the context.
    ///
    /// Concurrent tasks each see their own ambient slot.
    pub async fn scope<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        let output = CURRENT.scope(self.clone(), fut).await;
        self.exit();
        output
    }

    /// The ambient context of the current async task.
    pub fn current() -> Result<Self, StaleObject> {
        CURRENT
            .try_with(|ctx| ctx.clone())
            .map_err(|_| StaleObject("no active data context in this task".to_owned()))
    }

    /// Fail if the context's scope has already exited.
    pub fn ensure_live(&self) -> Result<(), StaleObject> {
        if self.inner.stale.load(Ordering::SeqCst) {
            return Err(StaleObject(
                "data context used after its scope exited".to_owned(),
            ));
        }
        Ok(())
    }

    /// The data-store client. Callers go through operations that check
    /// staleness; the client itself is scope-agnostic.
    pub fn client(&self) -> &ChClient {
        &self.inner.client
    }

    /// The lifecycle handler objects register with.
    pub fn lifecycle(&self) -> &Arc<dyn LifecycleHandler> {
        &self.inner.lifecycle
    }

    fn exit(&self) {
        self.inner.stale.store(true, Ordering::SeqCst);
        if self.inner.owns_handler {
            self.inner.lifecycle.stop();
        }
    }

    /// Materialize a serializable value as a new data-artifact table and
    /// return an [`Object`] handle to it.
    ///
    /// An array becomes one row per element; any other value becomes a
    /// single row; `null` becomes an empty table. Rows are keyed by
    /// snowflake `aai_id`, the canonical creation-time ordering.
    pub async fn create_object_from_value(&self, value: &serde_json::Value) -> Result<Object> {
        self.ensure_live()?;

        let id = snowflake::get_snowflake_id()?;
        let table = snowflake::table_name(id);

        let rows: Vec<serde_json::Value> = match value {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };

        let column_type = infer_column_type(&rows);
        self.client()
            .execute(&format!(
                "CREATE TABLE {table} (aai_id Int64, value {column_type}) \
                 ENGINE = MergeTree ORDER BY aai_id"
            ))
            .await?;

        if !rows.is_empty() {
            let ids = snowflake::get_snowflake_ids(rows.len())?;
            let mut body = format!("INSERT INTO {table} (aai_id, value) FORMAT JSONEachRow\n");
            for (aai_id, row) in ids.iter().zip(&rows) {
                let stored = match (column_type, row) {
                    (ColumnType::String, serde_json::Value::String(_)) => row.clone(),
                    (ColumnType::String, other) => {
                        serde_json::Value::String(other.to_string())
                    }
                    _ => row.clone(),
                };
                let line = serde_json::json!({ "aai_id": aai_id, "value": stored });
                body.push_str(&line.to_string());
                body.push('\n');
            }
            self.client().execute(&body).await?;
        }

        Ok(Object::attach(self, table))
    }
}

/// Inferred storage type for the single `value` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Int64,
    Float64,
    String,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Int64 => "Int64",
            Self::Float64 => "Float64",
            Self::String => "String",
        };
        f.write_str(s)
    }
}

/// Pick a column type covering every row: all integers stay Int64, any
/// float widens to Float64, anything else is stored as String (non-string
/// values as their JSON text).
fn infer_column_type(rows: &[serde_json::Value]) -> ColumnType {
    let mut column = ColumnType::Int64;
    for row in rows {
        match row {
            serde_json::Value::Number(n) if n.is_i64() => {}
            serde_json::Value::Number(_) => {
                if column == ColumnType::Int64 {
                    column = ColumnType::Float64;
                }
            }
            _ => return ColumnType::String,
        }
    }
    column
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_type_inference() {
        assert_eq!(infer_column_type(&[json!(1), json!(2)]), ColumnType::Int64);
        assert_eq!(
            infer_column_type(&[json!(1), json!(2.5)]),
            ColumnType::Float64
        );
        assert_eq!(
            infer_column_type(&[json!("a"), json!("b")]),
            ColumnType::String
        );
        assert_eq!(
            infer_column_type(&[json!(1), json!({"k": 1})]),
            ColumnType::String
        );
        assert_eq!(infer_column_type(&[]), ColumnType::Int64);
    }

    #[tokio::test]
    async fn ambient_slot_is_per_task() {
        assert!(DataContext::current().is_err());

        let ctx = DataContext::new(ChConfig::from_env(), None).unwrap();
        ctx.scope(async {
            let ambient = DataContext::current().unwrap();
            ambient.ensure_live().unwrap();

            // A sibling task has its own (empty) slot.
            let sibling = tokio::spawn(async { DataContext::current().is_err() });
            assert!(sibling.await.unwrap());
        })
        .await;

        assert!(DataContext::current().is_err());
    }

    #[tokio::test]
    async fn context_goes_stale_on_scope_exit() {
        let ctx = DataContext::new(ChConfig::from_env(), None).unwrap();
        let escaped = ctx.scope(async { DataContext::current().unwrap() }).await;

        let err = escaped.ensure_live().unwrap_err();
        assert!(err.to_string().contains("stale"));
    }
}
