//! Integration tests for the single-process debug runner.
//!
//! Callbacks here stay off the data plane (they return `None` or fail), so
//! the suite runs against PostgreSQL alone.

use serde_json::json;

use aaiclick_core::dag::create_task;
use aaiclick_core::data::ChConfig;
use aaiclick_core::orch::OrchContext;
use aaiclick_core::registry::CallbackRegistry;
use aaiclick_core::runner::run_job_test;
use aaiclick_db::models::{JobStatus, TaskStatus};
use aaiclick_db::queries::{jobs, tasks};

use aaiclick_test_utils::TestDb;

/// Route task logs into a tempdir for the duration of a test.
fn logs_in_tempdir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    // Env mutation is process-wide; every test in this binary routes logs
    // through some live tempdir, and assertions read task.log_path.
    unsafe {
        std::env::set_var("AAICLICK_LOG_DIR", dir.path());
    }
    dir
}

#[tokio::test]
async fn single_task_job_completes_with_null_result() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let ctx = OrchContext::from_pool(pool.clone());

    let mut registry = CallbackRegistry::new();
    registry.register("pkg.task1", |ctx| async move {
        ctx.log.write_line("hello from task1");
        Ok(None)
    });

    let (job, _entry) = ctx.create_job("basic", "pkg.task1").await.unwrap();
    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job.id)
        .await
        .unwrap();

    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());

    let task = &tasks::list_tasks_for_job(&pool, job.id).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.result.is_none());

    let log_path = task.log_path.as_deref().expect("log path recorded");
    let contents = std::fs::read_to_string(log_path).expect("log file exists");
    assert!(contents.contains("hello from task1"));

    db.teardown().await;
}

#[tokio::test]
async fn chain_executes_in_dependency_order() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let ctx = OrchContext::from_pool(pool.clone());

    let mut registry = CallbackRegistry::new();
    for name in ["pkg.t1", "pkg.t2", "pkg.t3"] {
        registry.register(name, |_ctx| async { Ok(None) });
    }

    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "chain").await.unwrap();

    let t1 = create_task("pkg.t1", json!({}));
    let t2 = create_task("pkg.t2", json!({}));
    let t3 = create_task("pkg.t3", json!({}));
    let _ = t1.clone() >> t2.clone() >> t3.clone();
    ctx.apply(&[t1.node(), t2.node(), t3.node()], job_id)
        .await
        .unwrap();

    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job_id)
        .await
        .unwrap();
    assert_eq!(finished.status, JobStatus::Completed);

    // No task was claimed before its predecessor completed.
    let rows = tasks::list_tasks_for_job(&pool, job_id).await.unwrap();
    let by_id = |id: Option<i64>| rows.iter().find(|t| Some(t.id) == id).unwrap();
    let (r1, r2, r3) = (by_id(t1.id()), by_id(t2.id()), by_id(t3.id()));

    assert!(r2.claimed_at.unwrap() >= r1.completed_at.unwrap());
    assert!(r3.claimed_at.unwrap() >= r2.completed_at.unwrap());

    db.teardown().await;
}

#[tokio::test]
async fn failing_callback_fails_task_and_job() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let ctx = OrchContext::from_pool(pool.clone());

    let mut registry = CallbackRegistry::new();
    registry.register("pkg.explode", |_ctx| async {
        anyhow::bail!("deliberate failure for the test")
    });

    let (job, _entry) = ctx.create_job("doomed", "pkg.explode").await.unwrap();
    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job.id)
        .await
        .unwrap();

    assert_eq!(finished.status, JobStatus::Failed);

    let task = &tasks::list_tasks_for_job(&pool, job.id).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.as_deref().expect("error recorded");
    assert!(error.contains("deliberate failure"));

    // The stringified failure also lands in the log file.
    let contents = std::fs::read_to_string(task.log_path.as_deref().unwrap()).unwrap();
    assert!(contents.contains("deliberate failure"));

    db.teardown().await;
}

#[tokio::test]
async fn unregistered_entrypoint_fails_the_task() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let ctx = OrchContext::from_pool(pool.clone());

    let registry = CallbackRegistry::new();
    let (job, _entry) = ctx.create_job("unknown", "pkg.nowhere").await.unwrap();
    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job.id)
        .await
        .unwrap();

    assert_eq!(finished.status, JobStatus::Failed);
    let task = &tasks::list_tasks_for_job(&pool, job.id).await.unwrap()[0];
    assert!(task.error.as_deref().unwrap().contains("pkg.nowhere"));

    db.teardown().await;
}

#[tokio::test]
async fn malformed_kwargs_fail_the_task() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let ctx = OrchContext::from_pool(pool.clone());

    let mut registry = CallbackRegistry::new();
    registry.register("pkg.wants_objects", |_ctx| async { Ok(None) });

    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "bad-kwargs").await.unwrap();

    // A native scalar is not a legal parameter.
    let task = create_task("pkg.wants_objects", json!({"n": 42}));
    ctx.apply(&[task.node()], job_id).await.unwrap();

    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job_id)
        .await
        .unwrap();
    assert_eq!(finished.status, JobStatus::Failed);

    let row = &tasks::list_tasks_for_job(&pool, job_id).await.unwrap()[0];
    assert!(row.error.as_deref().unwrap().contains("invalid task parameter"));

    db.teardown().await;
}

#[tokio::test]
async fn job_with_zero_tasks_never_runs() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let registry = CallbackRegistry::new();

    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "empty").await.unwrap();

    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job_id)
        .await
        .unwrap();

    assert_eq!(finished.status, JobStatus::Pending);
    assert!(finished.started_at.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn independent_failure_does_not_block_siblings() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let _logs = logs_in_tempdir();
    let ctx = OrchContext::from_pool(pool.clone());

    let mut registry = CallbackRegistry::new();
    registry.register("pkg.ok", |_ctx| async { Ok(None) });
    registry.register("pkg.bad", |_ctx| async { anyhow::bail!("nope") });

    let job_id = aaiclick_core::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "mixed").await.unwrap();

    let good = create_task("pkg.ok", json!({}));
    let bad = create_task("pkg.bad", json!({}));
    ctx.apply(&[good.node(), bad.node()], job_id).await.unwrap();

    let finished = run_job_test(&pool, &db.config(), &registry, &ChConfig::from_env(), job_id)
        .await
        .unwrap();

    // One failure fails the job, but the sibling still ran to completion.
    assert_eq!(finished.status, JobStatus::Failed);
    let rows = tasks::list_tasks_for_job(&pool, job_id).await.unwrap();
    let good_row = rows.iter().find(|t| Some(t.id) == good.id()).unwrap();
    let bad_row = rows.iter().find(|t| Some(t.id) == bad.id()).unwrap();
    assert_eq!(good_row.status, TaskStatus::Completed);
    assert_eq!(bad_row.status, TaskStatus::Failed);

    db.teardown().await;
}
