//! Object and View handles over data-artifact tables.
//!
//! An [`Object`] addresses a whole table; a [`View`] is a read-only
//! projection constrained by `where`/`offset`/`limit`. Both register a
//! reference with the context's lifecycle handler on creation and release
//! it on drop, from whatever thread the drop happens on -- the release path
//! only enqueues and never blocks.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use super::DataContext;

/// A handle to one data-artifact table, rows keyed by `aai_id`.
pub struct Object {
    ctx: DataContext,
    table_id: String,
    detached: AtomicBool,
}

impl Object {
    /// Bind a handle to an existing table under the given context,
    /// registering a reference.
    pub fn attach(ctx: &DataContext, table_id: String) -> Self {
        ctx.lifecycle().incref(&table_id);
        Self {
            ctx: ctx.clone(),
            table_id,
            detached: AtomicBool::new(false),
        }
    }

    /// The table this object addresses.
    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    /// Consume the handle without releasing its reference, returning the
    /// table name. Used when the reference ownership moves elsewhere --
    /// e.g. into a persisted task result.
    pub fn detach(self) -> String {
        self.detached.store(true, Ordering::SeqCst);
        self.table_id.clone()
    }

    /// Read the object's values in creation order (`aai_id` ascending).
    ///
    /// Creation-time ordering is what makes concatenation commutative: the
    /// result is ordered by when rows were made, not by argument order.
    pub async fn data(&self) -> Result<Vec<serde_json::Value>> {
        self.ctx.ensure_live()?;
        let rows = self
            .ctx
            .client()
            .query_rows(&format!(
                "SELECT value FROM {} ORDER BY aai_id",
                self.table_id
            ))
            .await?;
        Ok(extract_values(rows))
    }

    /// Concatenate with another object into a new object.
    pub async fn concat(&self, other: &Object) -> Result<Object> {
        concat(self, other).await
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::SeqCst) {
            self.ctx.lifecycle().decref(&self.table_id);
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("table_id", &self.table_id)
            .finish()
    }
}

/// Concatenate two objects into a new object holding the union of their
/// rows.
///
/// `concat(a, b).data() == concat(b, a).data()`: both read back ordered by
/// `aai_id`, so the result is creation-time ordered regardless of argument
/// order.
pub async fn concat(a: &Object, b: &Object) -> Result<Object> {
    a.ctx.ensure_live()?;

    let id = crate::snowflake::get_snowflake_id()?;
    let table = crate::snowflake::table_name(id);

    let client = a.ctx.client();
    client
        .execute(&format!("CREATE TABLE {table} AS {}", a.table_id))
        .await?;
    client
        .execute(&format!(
            "INSERT INTO {table} SELECT * FROM {}",
            a.table_id
        ))
        .await?;
    client
        .execute(&format!(
            "INSERT INTO {table} SELECT * FROM {}",
            b.table_id
        ))
        .await?;

    Ok(Object::attach(&a.ctx, table))
}

/// A read-only constrained projection over an object's table.
pub struct View {
    ctx: DataContext,
    table_id: String,
    offset: Option<u64>,
    limit: Option<u64>,
    where_clause: Option<String>,
}

impl View {
    /// Bind a view to an existing table under the given context,
    /// registering a reference.
    pub fn attach(
        ctx: &DataContext,
        table_id: String,
        offset: Option<u64>,
        limit: Option<u64>,
        where_clause: Option<String>,
    ) -> Self {
        ctx.lifecycle().incref(&table_id);
        Self {
            ctx: ctx.clone(),
            table_id,
            offset,
            limit,
            where_clause,
        }
    }

    /// The table this view projects.
    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    /// Read the projected values in creation order.
    pub async fn data(&self) -> Result<Vec<serde_json::Value>> {
        self.ctx.ensure_live()?;
        let rows = self.ctx.client().query_rows(&self.select_sql()).await?;
        Ok(extract_values(rows))
    }

    fn select_sql(&self) -> String {
        let mut sql = format!("SELECT value FROM {}", self.table_id);
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        sql.push_str(" ORDER BY aai_id");
        // ClickHouse requires LIMIT when OFFSET is present.
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => {
                sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {offset}"));
            }
            (None, None) => {}
        }
        sql
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.ctx.lifecycle().decref(&self.table_id);
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("table_id", &self.table_id)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("where", &self.where_clause)
            .finish()
    }
}

fn extract_values(rows: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    rows.into_iter()
        .map(|mut row| {
            row.get_mut("value")
                .map(serde_json::Value::take)
                .unwrap_or(serde_json::Value::Null)
        })
        .collect()
}
