//! Execution of a claimed task: resolve the callback, hydrate kwargs, run
//! inside a fresh data-plane scope with output captured to the task's log
//! file, and convert the return value into a stored result reference.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, warn};

use aaiclick_db::models::Task;
use aaiclick_db::queries::tasks;

use crate::data::{ChConfig, DataContext, Object, View};
use crate::lifecycle::LifecycleHandler;
use crate::params::{self, ParamRef};
use crate::registry::{CallbackRegistry, Param, TaskContext};

/// Resolve the task log directory.
///
/// `AAICLICK_LOG_DIR` wins when set; otherwise the OS default
/// (`~/.aaiclick/logs` on macOS, `/var/log/aaiclick` on Linux).
pub fn logs_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AAICLICK_LOG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .map(|home| home.join(".aaiclick").join("logs"))
            .unwrap_or_else(|| PathBuf::from("/tmp/aaiclick/logs"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        PathBuf::from("/var/log/aaiclick")
    }
}

/// A task's log sink: one file at `<logs_dir>/<task_id>.log`, UTF-8,
/// carrying the callback's emitted output in order. Not rotated.
#[derive(Clone)]
pub struct TaskLog {
    file: Arc<Mutex<std::fs::File>>,
    path: PathBuf,
}

impl TaskLog {
    /// Create (or truncate) the log file, creating the directory if absent.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_owned(),
        })
    }

    /// Append one line. Best-effort: a full disk should not fail the task.
    pub fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            warn!(path = %self.path.display(), error = %e, "failed to write task log line");
        }
    }

    /// Flush buffered output to disk.
    pub fn flush(&self) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = file.flush();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// How a task execution ended. The caller (worker loop or debug runner)
/// records this in the state store.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Callback returned; `result` is the stored reference blob, or `None`
    /// for a NULL result.
    Completed { result: Option<serde_json::Value> },
    /// Callback (or its setup) failed; the message is recorded as the
    /// task's error.
    Failed { error: String },
}

/// Execute one claimed task end to end.
///
/// Marks the task RUNNING, opens its log sink, resolves the callback,
/// hydrates kwargs, and runs the callback inside a fresh [`DataContext`]
/// scope (ambient for the callback's async task). Returns the outcome
/// rather than writing the terminal status: recording COMPLETED/FAILED is
/// the caller's move. Every failure path lands in the log file before this
/// returns, and the log is flushed regardless.
pub async fn execute_claimed_task(
    pool: &PgPool,
    registry: &CallbackRegistry,
    ch_config: &ChConfig,
    lifecycle: Option<Arc<dyn LifecycleHandler>>,
    task: &Task,
) -> Result<TaskOutcome> {
    let log_path = logs_dir().join(format!("{}.log", task.id));
    let log = TaskLog::open(&log_path)?;

    tasks::mark_running(pool, task.id, &log_path.to_string_lossy()).await?;
    debug!(task_id = task.id, entrypoint = %task.entrypoint, "task running");

    let outcome = run_callback(registry, ch_config, lifecycle, task, log.clone()).await;

    if let TaskOutcome::Failed { error } = &outcome {
        log.write_line(error);
    }
    log.flush();

    Ok(outcome)
}

async fn run_callback(
    registry: &CallbackRegistry,
    ch_config: &ChConfig,
    lifecycle: Option<Arc<dyn LifecycleHandler>>,
    task: &Task,
    log: TaskLog,
) -> TaskOutcome {
    let callback = match registry.resolve(&task.entrypoint) {
        Ok(callback) => callback,
        Err(e) => {
            return TaskOutcome::Failed {
                error: format!("{e}"),
            };
        }
    };

    let param_refs = match params::parse_kwargs(&task.kwargs) {
        Ok(param_refs) => param_refs,
        Err(e) => {
            return TaskOutcome::Failed {
                error: format!("{e}"),
            };
        }
    };

    let ctx = match DataContext::new(ch_config.clone(), lifecycle) {
        Ok(ctx) => ctx,
        Err(e) => {
            return TaskOutcome::Failed {
                error: format!("failed to open data context: {e:#}"),
            };
        }
    };

    let task_id = task.id;
    let scoped_ctx = ctx.clone();
    let result = ctx
        .scope(async move {
            // Hydration, the callback, and result conversion all happen
            // inside the scope: parameter handles must release their
            // references while the context's lifecycle handler is live.
            let kwargs = hydrate_kwargs(&scoped_ctx, &param_refs);
            let task_ctx = TaskContext {
                task_id,
                kwargs,
                log,
                data: scoped_ctx.clone(),
            };

            match callback(task_ctx).await {
                Ok(None) => Ok(None),
                Ok(Some(value)) => {
                    let object = scoped_ctx.create_object_from_value(&value).await?;
                    let table_id = object.detach();
                    Ok(Some(params::object_result(&table_id)))
                }
                Err(e) => Err(e),
            }
        })
        .await;

    match result {
        Ok(result) => TaskOutcome::Completed { result },
        Err(e) => TaskOutcome::Failed {
            error: format!("{e:?}"),
        },
    }
}

fn hydrate_kwargs(
    ctx: &DataContext,
    param_refs: &BTreeMap<String, ParamRef>,
) -> BTreeMap<String, Param> {
    param_refs
        .iter()
        .map(|(name, param)| {
            let hydrated = match param {
                ParamRef::Object { table_id } => {
                    Param::Object(Object::attach(ctx, table_id.clone()))
                }
                ParamRef::View {
                    table_id,
                    offset,
                    limit,
                    where_clause,
                } => Param::View(View::attach(
                    ctx,
                    table_id.clone(),
                    *offset,
                    *limit,
                    where_clause.clone(),
                )),
            };
            (name.clone(), hydrated)
        })
        .collect()
}
