//! Callback registry -- a named collection of executable task entrypoints.
//!
//! A task row stores its `entrypoint` as a plain string; the registry maps
//! that string to an async callback at execution time. Worker binaries
//! register their callbacks at startup, so persisted tasks stay portable
//! across any binary that registers the same names.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use crate::data::{DataContext, Object, View};
use crate::error::EntrypointResolutionError;
use crate::executor::TaskLog;

/// A hydrated task parameter.
pub enum Param {
    Object(Object),
    View(View),
}

impl Param {
    /// The table the parameter references.
    pub fn table_id(&self) -> &str {
        match self {
            Self::Object(object) => object.table_id(),
            Self::View(view) => view.table_id(),
        }
    }

    /// Read the referenced values in creation order.
    pub async fn data(&self) -> anyhow::Result<Vec<serde_json::Value>> {
        match self {
            Self::Object(object) => object.data().await,
            Self::View(view) => view.data().await,
        }
    }
}

/// Everything a callback gets handed when it runs.
pub struct TaskContext {
    /// The executing task's ID.
    pub task_id: i64,
    /// Hydrated kwargs, by parameter name.
    pub kwargs: BTreeMap<String, Param>,
    /// Sink for the task's captured output; lands in the task's log file.
    pub log: TaskLog,
    /// The task's data-plane context. Also installed as the ambient context
    /// for the callback's async task.
    pub data: DataContext,
}

/// What a callback returns: `None` maps to a NULL task result, any value is
/// materialized as a new Object.
pub type CallbackResult = anyhow::Result<Option<serde_json::Value>>;

type BoxedCallback =
    Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = CallbackResult> + Send>> + Send + Sync>;

/// A collection of registered callbacks, keyed by entrypoint name.
///
/// # Example
///
/// ```ignore
/// let mut registry = CallbackRegistry::new();
/// registry.register("pkg.double", |ctx| async move {
///     let rows = ctx.kwargs["input"].data().await?;
///     Ok(Some(serde_json::json!(rows.len())))
/// });
/// ```
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, BoxedCallback>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under an entrypoint name.
    ///
    /// If the name is already registered, the previous callback is replaced.
    pub fn register<F, Fut>(&mut self, entrypoint: &str, callback: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.callbacks.insert(
            entrypoint.to_owned(),
            Arc::new(move |ctx| Box::pin(callback(ctx))),
        );
    }

    /// Resolve an entrypoint to its callback.
    pub fn resolve(&self, entrypoint: &str) -> Result<BoxedCallback, EntrypointResolutionError> {
        self.callbacks
            .get(entrypoint)
            .cloned()
            .ok_or_else(|| EntrypointResolutionError(entrypoint.to_owned()))
    }

    /// List the registered entrypoint names.
    pub fn list(&self) -> Vec<&str> {
        self.callbacks.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("entrypoints", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let registry = CallbackRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.resolve("pkg.missing").is_err());
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = CallbackRegistry::new();
        registry.register("pkg.noop", |_ctx| async { Ok(None) });

        assert!(registry.resolve("pkg.noop").is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_entrypoint_names_itself() {
        let registry = CallbackRegistry::new();
        let err = match registry.resolve("mod.sub.fn") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail for unknown entrypoint"),
        };
        assert!(err.to_string().contains("mod.sub.fn"));
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = CallbackRegistry::new();
        registry.register("pkg.f", |_ctx| async { Ok(None) });
        registry.register("pkg.f", |_ctx| async { Ok(Some(serde_json::json!(1))) });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = CallbackRegistry::new();
        registry.register("pkg.a", |_ctx| async { Ok(None) });
        registry.register("pkg.b", |_ctx| async { Ok(None) });

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["pkg.a", "pkg.b"]);
    }
}
