//! Debug runner: synchronous single-process execution of a job.
//!
//! Used for unit tests and local iteration. The readiness predicate is the
//! in-memory equivalent of the claim protocol's SQL -- no row locking, since
//! there is only one executor. Exceptions surface directly; job status is
//! updated the same way the distributed path updates it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use aaiclick_db::config::DbConfig;
use aaiclick_db::models::{DepKind, Dependency, Job, Task, TaskStatus};
use aaiclick_db::queries::{dependencies, jobs, tasks};

use crate::data::ChConfig;
use crate::executor::{TaskOutcome, execute_claimed_task};
use crate::lifecycle::{DistributedLifecycle, LifecycleHandler};
use crate::registry::CallbackRegistry;

/// Compute the IDs of tasks that are ready to claim.
///
/// Same semantics as the claim SQL: the task is PENDING, every predecessor
/// edge on the task is satisfied, and every predecessor edge on the task's
/// owning group is satisfied. A `task` predecessor is satisfied when it is
/// COMPLETED; a `group` predecessor when every task in the group is
/// COMPLETED (vacuously satisfied for an empty group).
pub fn ready_task_ids(all_tasks: &[Task], deps: &[Dependency]) -> Vec<i64> {
    let completed: HashSet<i64> = all_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id)
        .collect();

    let mut group_members: HashMap<i64, Vec<i64>> = HashMap::new();
    for task in all_tasks {
        if let Some(group_id) = task.group_id {
            group_members.entry(group_id).or_default().push(task.id);
        }
    }

    let group_complete = |group_id: i64| -> bool {
        group_members
            .get(&group_id)
            .map(|members| members.iter().all(|id| completed.contains(id)))
            .unwrap_or(true)
    };

    let edge_satisfied = |dep: &Dependency| -> bool {
        match dep.previous_type {
            DepKind::Task => completed.contains(&dep.previous_id),
            DepKind::Group => group_complete(dep.previous_id),
        }
    };

    all_tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| {
            deps.iter()
                .filter(|d| d.next_type == DepKind::Task && d.next_id == task.id)
                .all(&edge_satisfied)
        })
        .filter(|task| match task.group_id {
            None => true,
            Some(group_id) => deps
                .iter()
                .filter(|d| d.next_type == DepKind::Group && d.next_id == group_id)
                .all(&edge_satisfied),
        })
        .map(|task| task.id)
        .collect()
}

/// Execute all of a job's tasks in dependency order inside the current
/// process, then finalize the job.
///
/// A job with zero tasks never becomes RUNNING; it is returned untouched.
/// If no task is ready while non-terminal tasks remain, the graph is wedged
/// (a cycle that slipped past validation, or an edge onto a task that never
/// got applied) and the runner bails rather than spinning.
///
/// The runner owns one lifecycle handler for the whole run and shares it
/// with every task's data context, as a worker shares its handler across
/// claims: a result table must outlive the task that produced it, both for
/// the stored result reference and for downstream tasks that read it.
pub async fn run_job_test(
    pool: &PgPool,
    db_config: &DbConfig,
    registry: &CallbackRegistry,
    ch_config: &ChConfig,
    job_id: i64,
) -> Result<Job> {
    let lifecycle: Arc<dyn LifecycleHandler> =
        Arc::new(DistributedLifecycle::new(db_config.clone()));
    lifecycle.start();

    let job = drive_job(pool, registry, ch_config, &lifecycle, job_id).await;
    lifecycle.stop();
    job
}

async fn drive_job(
    pool: &PgPool,
    registry: &CallbackRegistry,
    ch_config: &ChConfig,
    lifecycle: &Arc<dyn LifecycleHandler>,
    job_id: i64,
) -> Result<Job> {
    loop {
        let all_tasks = tasks::list_tasks_for_job(pool, job_id).await?;
        if all_tasks.is_empty() {
            return jobs::get_job(pool, job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"));
        }

        if all_tasks.iter().all(|t| t.status.is_terminal()) {
            jobs::finalize_if_terminal(pool, job_id).await?;
            return jobs::get_job(pool, job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"));
        }

        let deps = dependencies::list_for_job(pool, job_id).await?;
        let ready = ready_task_ids(&all_tasks, &deps);
        if ready.is_empty() {
            bail!("job {job_id} has no ready tasks but is not terminal");
        }

        for task_id in ready {
            let claimed = tasks::claim_for_runner(pool, task_id).await?;
            if claimed == 0 {
                continue;
            }
            jobs::arm_job(pool, job_id).await?;

            let task = tasks::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} vanished after claim"))?;

            match execute_claimed_task(pool, registry, ch_config, Some(Arc::clone(lifecycle)), &task)
                .await?
            {
                TaskOutcome::Completed { result } => {
                    tasks::mark_completed(pool, task_id, result.as_ref()).await?;
                }
                TaskOutcome::Failed { error } => {
                    tasks::mark_failed(pool, task_id, &error).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: i64, group_id: Option<i64>, status: TaskStatus) -> Task {
        Task {
            id,
            job_id: 1,
            group_id,
            entrypoint: "pkg.t".to_owned(),
            kwargs: serde_json::json!({}),
            status,
            result: None,
            error: None,
            worker_id: None,
            log_path: None,
            max_retries: 0,
            retry_count: 0,
            created_at: Utc::now(),
            claimed_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn dep(prev: i64, prev_kind: DepKind, next: i64, next_kind: DepKind) -> Dependency {
        Dependency {
            previous_id: prev,
            previous_type: prev_kind,
            next_id: next,
            next_type: next_kind,
        }
    }

    #[test]
    fn unconstrained_pending_tasks_are_ready() {
        let tasks = vec![
            task(1, None, TaskStatus::Pending),
            task(2, None, TaskStatus::Pending),
        ];
        assert_eq!(ready_task_ids(&tasks, &[]), vec![1, 2]);
    }

    #[test]
    fn task_edge_gates_until_completed() {
        let mut tasks = vec![
            task(1, None, TaskStatus::Pending),
            task(2, None, TaskStatus::Pending),
        ];
        let deps = vec![dep(1, DepKind::Task, 2, DepKind::Task)];

        assert_eq!(ready_task_ids(&tasks, &deps), vec![1]);

        tasks[0].status = TaskStatus::Completed;
        assert_eq!(ready_task_ids(&tasks, &deps), vec![2]);
    }

    #[test]
    fn running_predecessor_is_not_enough() {
        let tasks = vec![
            task(1, None, TaskStatus::Running),
            task(2, None, TaskStatus::Pending),
        ];
        let deps = vec![dep(1, DepKind::Task, 2, DepKind::Task)];
        assert!(ready_task_ids(&tasks, &deps).is_empty());
    }

    #[test]
    fn group_predecessor_requires_every_member() {
        let group_id = 100;
        let mut tasks = vec![
            task(1, Some(group_id), TaskStatus::Completed),
            task(2, Some(group_id), TaskStatus::Running),
            task(3, None, TaskStatus::Pending),
        ];
        let deps = vec![dep(group_id, DepKind::Group, 3, DepKind::Task)];

        assert!(ready_task_ids(&tasks, &deps).is_empty());

        tasks[1].status = TaskStatus::Completed;
        assert_eq!(ready_task_ids(&tasks, &deps), vec![3]);
    }

    #[test]
    fn empty_group_predecessor_is_vacuously_satisfied() {
        let tasks = vec![task(1, None, TaskStatus::Pending)];
        let deps = vec![dep(999, DepKind::Group, 1, DepKind::Task)];
        assert_eq!(ready_task_ids(&tasks, &deps), vec![1]);
    }

    #[test]
    fn group_membership_gates_members() {
        // tpre >> g; members of g wait on tpre, then both free up together.
        let group_id = 100;
        let mut tasks = vec![
            task(1, None, TaskStatus::Pending),
            task(2, Some(group_id), TaskStatus::Pending),
            task(3, Some(group_id), TaskStatus::Pending),
        ];
        let deps = vec![dep(1, DepKind::Task, group_id, DepKind::Group)];

        assert_eq!(ready_task_ids(&tasks, &deps), vec![1]);

        tasks[0].status = TaskStatus::Completed;
        assert_eq!(ready_task_ids(&tasks, &deps), vec![2, 3]);
    }

    #[test]
    fn terminal_tasks_are_never_ready() {
        let tasks = vec![
            task(1, None, TaskStatus::Completed),
            task(2, None, TaskStatus::Failed),
            task(3, None, TaskStatus::Claimed),
        ];
        assert!(ready_task_ids(&tasks, &[]).is_empty());
    }

    #[test]
    fn failed_predecessor_blocks_forever() {
        let tasks = vec![
            task(1, None, TaskStatus::Failed),
            task(2, None, TaskStatus::Pending),
        ];
        let deps = vec![dep(1, DepKind::Task, 2, DepKind::Task)];
        assert!(ready_task_ids(&tasks, &deps).is_empty());
    }
}
