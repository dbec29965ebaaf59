//! Orchestration context: the scoped handle over the state-store engine.
//!
//! Every operation opens a short-lived session or transaction; nothing
//! bridges across operations. [`OrchContext::apply`] is the primary write
//! path: it persists a graph fragment -- tasks, groups, and their buffered
//! dependency edges -- atomically.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use aaiclick_db::config::DbConfig;
use aaiclick_db::models::Job;
use aaiclick_db::pool::create_pool;
use aaiclick_db::queries::{dependencies, groups, jobs, tasks};

use crate::dag::{Group, Node, Task, create_task};
use crate::snowflake;

/// A handle over the state store. Connection pooling is the engine's.
pub struct OrchContext {
    pool: PgPool,
}

impl OrchContext {
    /// Connect using `POSTGRES_*` environment configuration.
    pub async fn connect() -> Result<Self> {
        Self::with_config(&DbConfig::from_env()).await
    }

    /// Connect to an explicit state store.
    pub async fn with_config(config: &DbConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (shared with a worker, or a test harness).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying engine.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Dispose the engine.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Create a job with a single entry task and persist both.
    ///
    /// Returns the job row and the entry task handle, which can seed further
    /// graph construction before another `apply`.
    pub async fn create_job(&self, name: &str, entrypoint: &str) -> Result<(Job, Task)> {
        let job_id = snowflake::get_snowflake_id()?;
        let job = jobs::insert_job(&self.pool, job_id, name).await?;

        let entry = create_task(entrypoint, serde_json::json!({}));
        self.apply(&[entry.node()], job_id).await?;

        Ok((job, entry))
    }

    /// Persist a graph fragment atomically.
    ///
    /// 1. Walks group membership to collect every reachable item, rejecting
    ///    groups that contain themselves (directly or transitively).
    /// 2. Assigns `job_id` to every item lacking one and snowflake IDs to
    ///    any unset task/group, then binds members to their containers.
    /// 3. Validates the fragment's expanded dependency relation is acyclic.
    /// 4. In one transaction: inserts group rows (parents first), task rows,
    ///    and a dependency row per buffered pending edge.
    /// 5. On commit, clears the in-memory pending-edge buffers.
    ///
    /// Any failure rolls the whole call back and leaves the buffers intact.
    /// Re-presenting already-persisted items is a no-op (inserts are
    /// conflict-free), so `apply` may be invoked repeatedly across the life
    /// of a job -- dynamic task creation from inside a running task does
    /// exactly that.
    pub async fn apply(&self, items: &[Node], job_id: i64) -> Result<()> {
        let all = collect_items(items)?;

        for node in &all {
            match node {
                Node::Task(task) => {
                    if task.id().is_none() {
                        task.set_id(snowflake::get_snowflake_id()?);
                    }
                    task.set_job_id(job_id);
                }
                Node::Group(group) => {
                    if group.id().is_none() {
                        group.set_id(snowflake::get_snowflake_id()?);
                    }
                    group.set_job_id(job_id);
                }
            }
        }

        // Bind members to their containers now that IDs exist.
        for node in &all {
            if let Node::Group(group) = node {
                let group_id = group.id().context("group id unset after assignment")?;
                for member in group.members() {
                    match member {
                        Node::Task(task) => task.set_group_id(group_id),
                        Node::Group(sub) => sub.set_parent_group_id(group_id),
                    }
                }
            }
        }

        validate_acyclic(&all)?;

        let mut tx = self.pool.begin().await.context("failed to open apply transaction")?;

        for group in sorted_groups(&all) {
            groups::insert_group(
                &mut *tx,
                group.id().context("group id unset")?,
                group.job_id().unwrap_or(job_id),
                group.parent_group_id(),
                &group.name(),
            )
            .await?;
        }

        for node in &all {
            if let Node::Task(task) = node {
                tasks::insert_task(
                    &mut *tx,
                    task.id().context("task id unset")?,
                    task.job_id().unwrap_or(job_id),
                    task.group_id(),
                    &task.entrypoint(),
                    &task.kwargs(),
                )
                .await?;
            }
        }

        for node in &all {
            let next_id = node.id().context("node id unset")?;
            for prev in node.pending_prev() {
                let prev_id = prev.id().with_context(|| {
                    "dependency references an item that was never applied".to_owned()
                })?;
                dependencies::insert_dependency(&mut *tx, prev_id, prev.kind(), next_id, node.kind())
                    .await?;
            }
        }

        tx.commit().await.context("failed to commit apply")?;

        for node in &all {
            match node {
                Node::Task(task) => task.clear_pending(),
                Node::Group(group) => group.clear_pending(),
            }
        }

        Ok(())
    }
}

/// Collect the transitive closure of the given items over group membership,
/// deduplicated by handle identity. Rejects self-containing groups.
fn collect_items(items: &[Node]) -> Result<Vec<Node>> {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut out: Vec<Node> = Vec::new();
    let mut path: Vec<usize> = Vec::new();

    fn walk(
        node: &Node,
        seen: &mut HashSet<usize>,
        out: &mut Vec<Node>,
        path: &mut Vec<usize>,
    ) -> Result<()> {
        let key = node.ptr_key();

        if let Node::Group(group) = node {
            if path.contains(&key) {
                bail!("group {:?} contains itself", group.name());
            }
        }

        if !seen.insert(key) {
            return Ok(());
        }
        out.push(node.clone());

        if let Node::Group(group) = node {
            path.push(key);
            for member in group.members() {
                walk(&member, seen, out, path)?;
            }
            path.pop();
        }

        Ok(())
    }

    for item in items {
        walk(item, &mut seen, &mut out, &mut path)?;
    }

    Ok(out)
}

/// Validate that the fragment's dependency relation, expanded so a group
/// endpoint stands for all of its transitive member tasks, is a DAG.
fn validate_acyclic(all: &[Node]) -> Result<()> {
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();

    for node in all {
        let next_tasks = task_ids_of(node);
        for prev in node.pending_prev() {
            for &p in &task_ids_of(&prev) {
                for &n in &next_tasks {
                    adjacency.entry(p).or_default().push(n);
                }
            }
        }
    }

    // Iterative DFS with three colors.
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<i64, Color> = HashMap::new();
    let starts: Vec<i64> = adjacency.keys().copied().collect();

    for start in starts {
        if color.get(&start).copied().unwrap_or(Color::White) != Color::White {
            continue;
        }
        let mut stack: Vec<(i64, usize)> = vec![(start, 0)];
        color.insert(start, Color::Gray);

        while let Some((node, next_child)) = stack.last().copied() {
            let children = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if next_child < children.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let child = children[next_child];
                match color.get(&child).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(child, Color::Gray);
                        stack.push((child, 0));
                    }
                    Color::Gray => bail!("dependency graph contains a cycle through task {child}"),
                    Color::Black => {}
                }
            } else {
                color.insert(node, Color::Black);
                stack.pop();
            }
        }
    }

    Ok(())
}

/// The task IDs a dependency endpoint expands to: a task is itself, a group
/// is all of its transitive member tasks.
fn task_ids_of(node: &Node) -> Vec<i64> {
    match node {
        Node::Task(task) => task.id().into_iter().collect(),
        Node::Group(group) => {
            let mut out = Vec::new();
            let mut stack: Vec<Group> = vec![group.clone()];
            let mut seen: HashSet<usize> = HashSet::new();
            while let Some(current) = stack.pop() {
                if !seen.insert(Node::Group(current.clone()).ptr_key()) {
                    continue;
                }
                for member in current.members() {
                    match member {
                        Node::Task(task) => out.extend(task.id()),
                        Node::Group(sub) => stack.push(sub),
                    }
                }
            }
            out
        }
    }
}

/// Fragment groups ordered parents-before-children, so the parent FK is
/// satisfied at insert time.
fn sorted_groups(all: &[Node]) -> Vec<Group> {
    let groups: Vec<Group> = all
        .iter()
        .filter_map(|node| match node {
            Node::Group(group) => Some(group.clone()),
            Node::Task(_) => None,
        })
        .collect();

    let fragment_ids: HashSet<i64> = groups.iter().filter_map(Group::id).collect();
    let parents: HashMap<i64, i64> = groups
        .iter()
        .filter_map(|g| Some((g.id()?, g.parent_group_id()?)))
        .collect();

    let max_depth = parents.len();
    let depth = |group: &Group| -> usize {
        let mut depth = 0;
        let mut current = group.id();
        while let Some(id) = current {
            match parents.get(&id) {
                Some(parent) if fragment_ids.contains(parent) && depth <= max_depth => {
                    depth += 1;
                    current = Some(*parent);
                }
                _ => break,
            }
        }
        depth
    };

    let mut ordered = groups;
    ordered.sort_by_key(depth);
    ordered
}
