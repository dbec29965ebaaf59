//! In-memory DAG model: tasks, groups, and the dependency operator DSL.
//!
//! [`Task`] and [`Group`] are cheap-clone handles over shared state. Each
//! buffers a local list of *pending edges* -- predecessor nodes recorded by
//! the `>>`/`<<` operators (or the `after`/`after_all` methods backing
//! them). Nothing touches the database until [`OrchContext::apply`] flushes
//! the buffers into persistent dependency rows.
//!
//! [`OrchContext::apply`]: crate::orch::OrchContext::apply

mod ops;

pub use ops::{EdgeTarget, IntoNodes};

use std::sync::{Arc, Mutex, MutexGuard};

use aaiclick_db::models::DepKind;

#[derive(Debug, Default)]
struct TaskInner {
    id: Option<i64>,
    job_id: Option<i64>,
    group_id: Option<i64>,
    entrypoint: String,
    kwargs: serde_json::Value,
    pending_prev: Vec<Node>,
}

#[derive(Debug, Default)]
struct GroupInner {
    id: Option<i64>,
    job_id: Option<i64>,
    parent_group_id: Option<i64>,
    name: String,
    members: Vec<Node>,
    pending_prev: Vec<Node>,
}

/// An in-memory task: one callback invocation to be.
#[derive(Debug, Clone)]
pub struct Task {
    inner: Arc<Mutex<TaskInner>>,
}

/// An in-memory group: a structural container for tasks and sub-groups.
#[derive(Debug, Clone)]
pub struct Group {
    inner: Arc<Mutex<GroupInner>>,
}

/// Either side of a dependency edge.
#[derive(Debug, Clone)]
pub enum Node {
    Task(Task),
    Group(Group),
}

/// Create an in-memory task for a registered callback.
///
/// `kwargs` must be a JSON object of Object/View references (validated at
/// execution time). The task gets its snowflake ID, job binding, and group
/// binding when it is applied.
pub fn create_task(entrypoint: &str, kwargs: serde_json::Value) -> Task {
    Task::new(entrypoint, kwargs)
}

/// Create an in-memory group.
pub fn create_group(name: &str) -> Group {
    Group::new(name)
}

impl Task {
    pub fn new(entrypoint: &str, kwargs: serde_json::Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskInner {
                entrypoint: entrypoint.to_owned(),
                kwargs,
                ..TaskInner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Option<i64> {
        self.lock().id
    }

    pub fn job_id(&self) -> Option<i64> {
        self.lock().job_id
    }

    pub fn group_id(&self) -> Option<i64> {
        self.lock().group_id
    }

    pub fn entrypoint(&self) -> String {
        self.lock().entrypoint.clone()
    }

    pub fn kwargs(&self) -> serde_json::Value {
        self.lock().kwargs.clone()
    }

    pub(crate) fn set_id(&self, id: i64) {
        self.lock().id = Some(id);
    }

    pub(crate) fn set_job_id(&self, job_id: i64) {
        let mut inner = self.lock();
        if inner.job_id.is_none() {
            inner.job_id = Some(job_id);
        }
    }

    pub(crate) fn set_group_id(&self, group_id: i64) {
        let mut inner = self.lock();
        if inner.group_id.is_none() {
            inner.group_id = Some(group_id);
        }
    }

    /// Snapshot of the pending predecessor buffer.
    pub fn pending_prev(&self) -> Vec<Node> {
        self.lock().pending_prev.clone()
    }

    pub(crate) fn clear_pending(&self) {
        self.lock().pending_prev.clear();
    }

    /// Record that this task depends on `prev`. The builder-method form of
    /// `prev >> self`.
    pub fn after(&self, prev: &impl IntoNodes) -> &Self {
        self.record_prev_nodes(&prev.nodes());
        self
    }

    /// Record that this task depends on every element of `prevs`.
    pub fn after_all(&self, prevs: &[Node]) -> &Self {
        self.record_prev_nodes(prevs);
        self
    }

    /// This task as a dependency-edge endpoint.
    pub fn node(&self) -> Node {
        Node::Task(self.clone())
    }
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GroupInner {
                name: name.to_owned(),
                ..GroupInner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Option<i64> {
        self.lock().id
    }

    pub fn job_id(&self) -> Option<i64> {
        self.lock().job_id
    }

    pub fn parent_group_id(&self) -> Option<i64> {
        self.lock().parent_group_id
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub(crate) fn set_id(&self, id: i64) {
        self.lock().id = Some(id);
    }

    pub(crate) fn set_job_id(&self, job_id: i64) {
        let mut inner = self.lock();
        if inner.job_id.is_none() {
            inner.job_id = Some(job_id);
        }
    }

    pub(crate) fn set_parent_group_id(&self, parent: i64) {
        let mut inner = self.lock();
        if inner.parent_group_id.is_none() {
            inner.parent_group_id = Some(parent);
        }
    }

    /// Add a task or sub-group to this group.
    pub fn add(&self, member: impl Into<Node>) -> &Self {
        self.lock().members.push(member.into());
        self
    }

    /// Snapshot of the direct members.
    pub fn members(&self) -> Vec<Node> {
        self.lock().members.clone()
    }

    /// Snapshot of the pending predecessor buffer.
    pub fn pending_prev(&self) -> Vec<Node> {
        self.lock().pending_prev.clone()
    }

    pub(crate) fn clear_pending(&self) {
        self.lock().pending_prev.clear();
    }

    /// Record that this group depends on `prev`.
    pub fn after(&self, prev: &impl IntoNodes) -> &Self {
        self.record_prev_nodes(&prev.nodes());
        self
    }

    /// Record that this group depends on every element of `prevs`.
    pub fn after_all(&self, prevs: &[Node]) -> &Self {
        self.record_prev_nodes(prevs);
        self
    }

    /// This group as a dependency-edge endpoint.
    pub fn node(&self) -> Node {
        Node::Group(self.clone())
    }
}

impl Node {
    /// The endpoint kind this node persists as.
    pub fn kind(&self) -> DepKind {
        match self {
            Self::Task(_) => DepKind::Task,
            Self::Group(_) => DepKind::Group,
        }
    }

    /// The assigned snowflake ID, if any.
    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Task(task) => task.id(),
            Self::Group(group) => group.id(),
        }
    }

    /// Snapshot of the pending predecessor buffer.
    pub fn pending_prev(&self) -> Vec<Node> {
        match self {
            Self::Task(task) => task.pending_prev(),
            Self::Group(group) => group.pending_prev(),
        }
    }

    /// Pointer identity, for dedup during graph walks.
    pub(crate) fn ptr_key(&self) -> usize {
        match self {
            Self::Task(task) => Arc::as_ptr(&task.inner) as usize,
            Self::Group(group) => Arc::as_ptr(&group.inner) as usize,
        }
    }
}

impl From<Task> for Node {
    fn from(task: Task) -> Self {
        Node::Task(task)
    }
}

impl From<Group> for Node {
    fn from(group: Group) -> Self {
        Node::Group(group)
    }
}

impl From<&Task> for Node {
    fn from(task: &Task) -> Self {
        Node::Task(task.clone())
    }
}

impl From<&Group> for Node {
    fn from(group: &Group) -> Self {
        Node::Group(group.clone())
    }
}
