//! Integration tests for the distributed worker loop.
//!
//! These drive real workers over a containerized PostgreSQL. Callbacks stay
//! off the data plane, so no ClickHouse is required; the lifecycle handler
//! still exercises its state-store path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use aaiclick_core::dag::{create_group, create_task};
use aaiclick_core::orch::OrchContext;
use aaiclick_core::registry::CallbackRegistry;
use aaiclick_core::worker::{WorkerConfig, run_worker};
use aaiclick_core::data::ChConfig;
use aaiclick_db::models::{JobStatus, TaskStatus, WorkerStatus};
use aaiclick_db::queries::{jobs, tasks, workers};

use aaiclick_test_utils::TestDb;

fn logs_in_tempdir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    unsafe {
        std::env::set_var("AAICLICK_LOG_DIR", dir.path());
    }
    dir
}

fn drain_config(max_empty_polls: u64) -> WorkerConfig {
    WorkerConfig {
        heartbeat_interval: Duration::from_secs(1),
        poll_interval: Duration::from_millis(25),
        max_poll_interval: Duration::from_millis(100),
        max_tasks: None,
        max_empty_polls: Some(max_empty_polls),
        task_timeout: None,
        max_retries: None,
    }
}

fn noop_registry(entrypoints: &[&str]) -> Arc<CallbackRegistry> {
    let mut registry = CallbackRegistry::new();
    for name in entrypoints {
        registry.register(name, |_ctx| async {
            // A beat of latency so concurrent workers interleave.
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(None)
        });
    }
    Arc::new(registry)
}

#[tokio::test]
async fn worker_drains_a_job_and_stops() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let db_config = db.config();
    let ctx = OrchContext::from_pool(pool.clone());

    let registry = noop_registry(&["pkg.t"]);
    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "drain").await.unwrap();
    let items: Vec<_> = (0..3).map(|_| create_task("pkg.t", json!({})).node()).collect();
    ctx.apply(&items, job_id).await.unwrap();

    let summary = run_worker(
        &pool,
        &db_config,
        &ChConfig::from_env(),
        registry,
        &drain_config(5),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.tasks_completed, 3);
    assert_eq!(summary.tasks_failed, 0);

    let job = jobs::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let worker = workers::get_worker(&pool, summary.worker_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Stopped);
    assert_eq!(worker.tasks_completed, 3);

    db.teardown().await;
}

#[tokio::test]
async fn fan_in_claims_only_after_all_predecessors_complete() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let db_config = db.config();
    let ctx = OrchContext::from_pool(pool.clone());

    let registry = noop_registry(&["pkg.src", "pkg.sink"]);
    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "fan-in").await.unwrap();

    let t1 = create_task("pkg.src", json!({}));
    let t2 = create_task("pkg.src", json!({}));
    let t3 = create_task("pkg.src", json!({}));
    let t4 = create_task("pkg.sink", json!({}));
    let _ = vec![t1.clone(), t2.clone(), t3.clone()] >> t4.clone();
    ctx.apply(&[t1.node(), t2.node(), t3.node(), t4.node()], job_id)
        .await
        .unwrap();

    // A pool of two workers.
    let config = drain_config(40);
    let ch_config = ChConfig::from_env();
    let (a, b) = tokio::join!(
        run_worker(
            &pool,
            &db_config,
            &ch_config,
            Arc::clone(&registry),
            &config,
            CancellationToken::new(),
        ),
        run_worker(
            &pool,
            &db_config,
            &ch_config,
            Arc::clone(&registry),
            &config,
            CancellationToken::new(),
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.tasks_completed + b.tasks_completed, 4);

    let rows = tasks::list_tasks_for_job(&pool, job_id).await.unwrap();
    let row = |id: Option<i64>| rows.iter().find(|t| Some(t.id) == id).unwrap();
    let sink = row(t4.id());

    assert_eq!(sink.status, TaskStatus::Completed);
    for src in [row(t1.id()), row(t2.id()), row(t3.id())] {
        assert!(
            sink.claimed_at.unwrap() >= src.completed_at.unwrap(),
            "sink was claimed strictly after every source completed"
        );
    }

    db.teardown().await;
}

#[tokio::test]
async fn group_members_wait_for_the_group_edge() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let db_config = db.config();
    let ctx = OrchContext::from_pool(pool.clone());

    let registry = noop_registry(&["pkg.pre", "pkg.member"]);
    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "group-dep").await.unwrap();

    let tpre = create_task("pkg.pre", json!({}));
    let g1 = create_task("pkg.member", json!({}));
    let g2 = create_task("pkg.member", json!({}));
    let group = create_group("stage");
    group.add(&g1).add(&g2);
    let _ = tpre.clone() >> group.clone();
    ctx.apply(&[tpre.node(), group.node()], job_id).await.unwrap();

    let config = drain_config(40);
    let ch_config = ChConfig::from_env();
    let (a, b) = tokio::join!(
        run_worker(
            &pool,
            &db_config,
            &ch_config,
            Arc::clone(&registry),
            &config,
            CancellationToken::new(),
        ),
        run_worker(
            &pool,
            &db_config,
            &ch_config,
            Arc::clone(&registry),
            &config,
            CancellationToken::new(),
        ),
    );
    a.unwrap();
    b.unwrap();

    let rows = tasks::list_tasks_for_job(&pool, job_id).await.unwrap();
    let row = |id: Option<i64>| rows.iter().find(|t| Some(t.id) == id).unwrap();
    let pre = row(tpre.id());

    for member in [row(g1.id()), row(g2.id())] {
        assert_eq!(member.status, TaskStatus::Completed);
        assert!(
            member.claimed_at.unwrap() >= pre.completed_at.unwrap(),
            "group members stayed PENDING until the predecessor completed"
        );
    }

    let job = jobs::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    db.teardown().await;
}

#[tokio::test]
async fn worker_survives_failing_callbacks_and_drains_sibling_jobs() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let db_config = db.config();
    let ctx = OrchContext::from_pool(pool.clone());

    let mut registry = CallbackRegistry::new();
    registry.register("pkg.bad", |_ctx| async { anyhow::bail!("task blew up") });
    registry.register("pkg.ok", |_ctx| async { Ok(None) });
    let registry = Arc::new(registry);

    let (doomed, _t) = ctx.create_job("doomed", "pkg.bad").await.unwrap();
    let (healthy, _t) = ctx.create_job("healthy", "pkg.ok").await.unwrap();

    let summary = run_worker(
        &pool,
        &db_config,
        &ChConfig::from_env(),
        registry,
        &drain_config(5),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.tasks_completed, 1);
    assert_eq!(summary.tasks_failed, 1);

    let doomed = jobs::get_job(&pool, doomed.id).await.unwrap().unwrap();
    let healthy = jobs::get_job(&pool, healthy.id).await.unwrap().unwrap();
    assert_eq!(doomed.status, JobStatus::Failed);
    assert_eq!(healthy.status, JobStatus::Completed);

    let failed_task = &tasks::list_tasks_for_job(&pool, doomed.id).await.unwrap()[0];
    assert!(failed_task.error.as_deref().unwrap().contains("task blew up"));
    assert!(failed_task.log_path.is_some());

    db.teardown().await;
}

#[tokio::test]
async fn pool_of_workers_claims_each_task_exactly_once() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let db_config = db.config();
    let ctx = OrchContext::from_pool(pool.clone());

    let registry = noop_registry(&["pkg.t"]);
    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "exclusive").await.unwrap();
    let items: Vec<_> = (0..20).map(|_| create_task("pkg.t", json!({})).node()).collect();
    ctx.apply(&items, job_id).await.unwrap();

    let config = drain_config(40);
    let ch_config = ChConfig::from_env();
    let (a, b) = tokio::join!(
        run_worker(
            &pool,
            &db_config,
            &ch_config,
            Arc::clone(&registry),
            &config,
            CancellationToken::new(),
        ),
        run_worker(
            &pool,
            &db_config,
            &ch_config,
            Arc::clone(&registry),
            &config,
            CancellationToken::new(),
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.tasks_completed + b.tasks_completed, 20);

    let rows = tasks::list_tasks_for_job(&pool, job_id).await.unwrap();
    assert!(rows.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(
        rows.iter()
            .all(|t| t.worker_id == Some(a.worker_id) || t.worker_id == Some(b.worker_id)),
        "every task belongs to exactly one of the pool's workers"
    );

    db.teardown().await;
}

#[tokio::test]
async fn max_tasks_caps_a_worker() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let db_config = db.config();
    let ctx = OrchContext::from_pool(pool.clone());

    let registry = noop_registry(&["pkg.t"]);
    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "capped").await.unwrap();
    let items: Vec<_> = (0..5).map(|_| create_task("pkg.t", json!({})).node()).collect();
    ctx.apply(&items, job_id).await.unwrap();

    let mut config = drain_config(5);
    config.max_tasks = Some(2);

    let summary = run_worker(
        &pool,
        &db_config,
        &ChConfig::from_env(),
        registry,
        &config,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.tasks_completed, 2);

    let progress = jobs::job_progress(&pool, job_id).await.unwrap();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.pending, 3);

    db.teardown().await;
}
