//! Integration tests for `OrchContext::apply` and the job factory.

use serde_json::json;

use aaiclick_core::dag::{create_group, create_task};
use aaiclick_core::orch::OrchContext;
use aaiclick_core::snowflake;
use aaiclick_db::models::{DepKind, JobStatus, TaskStatus};
use aaiclick_db::queries::{dependencies, groups, jobs, tasks};

use aaiclick_test_utils::TestDb;

#[tokio::test]
async fn apply_persists_tasks_and_edges() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let job_id = snowflake::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "chain").await.unwrap();

    let t1 = create_task("pkg.one", json!({}));
    let t2 = create_task("pkg.two", json!({}));
    let t3 = create_task("pkg.three", json!({}));
    let _ = t1.clone() >> t2.clone() >> t3.clone();

    ctx.apply(&[t1.node(), t2.node(), t3.node()], job_id)
        .await
        .unwrap();

    let rows = tasks::list_tasks_for_job(&pool, job_id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|t| t.status == TaskStatus::Pending));
    assert_eq!(dependencies::count_for_job(&pool, job_id).await.unwrap(), 2);

    // Buffers are cleared on commit.
    assert!(t2.pending_prev().is_empty());
    assert!(t3.pending_prev().is_empty());

    db.teardown().await;
}

#[tokio::test]
async fn apply_is_idempotent_for_repeated_fragments() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let job_id = snowflake::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "idem").await.unwrap();

    let a = create_task("pkg.a", json!({}));
    let b = create_task("pkg.b", json!({}));
    let _ = a.clone() >> b.clone();

    ctx.apply(&[a.node(), b.node()], job_id).await.unwrap();

    // Re-record the same edge and re-present both items with their IDs
    // already assigned: no duplicate rows, no duplicate edges.
    b.after(&a);
    ctx.apply(&[a.node(), b.node()], job_id).await.unwrap();

    assert_eq!(
        tasks::list_tasks_for_job(&pool, job_id).await.unwrap().len(),
        2
    );
    assert_eq!(dependencies::count_for_job(&pool, job_id).await.unwrap(), 1);

    db.teardown().await;
}

#[tokio::test]
async fn apply_walks_group_membership_and_binds_it() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let job_id = snowflake::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "grouped").await.unwrap();

    let outer = create_group("outer");
    let inner = create_group("inner");
    let t1 = create_task("pkg.a", json!({}));
    let t2 = create_task("pkg.b", json!({}));
    outer.add(&t1).add(&inner);
    inner.add(&t2);

    // Only the outer group is presented; members ride along.
    ctx.apply(&[outer.node()], job_id).await.unwrap();

    let group_rows = groups::list_groups_for_job(&pool, job_id).await.unwrap();
    assert_eq!(group_rows.len(), 2);

    let inner_row = group_rows.iter().find(|g| g.name == "inner").unwrap();
    assert_eq!(inner_row.parent_group_id, outer.id());

    let t1_row = tasks::get_task(&pool, t1.id().unwrap()).await.unwrap().unwrap();
    assert_eq!(t1_row.group_id, outer.id());
    let t2_row = tasks::get_task(&pool, t2.id().unwrap()).await.unwrap().unwrap();
    assert_eq!(t2_row.group_id, inner.id());

    db.teardown().await;
}

#[tokio::test]
async fn apply_rejects_cycles_and_persists_nothing() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let job_id = snowflake::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "cyclic").await.unwrap();

    let a = create_task("pkg.a", json!({}));
    let b = create_task("pkg.b", json!({}));
    let _ = a.clone() >> b.clone();
    let _ = b.clone() >> a.clone();

    let result = ctx.apply(&[a.node(), b.node()], job_id).await;
    assert!(result.is_err());

    assert!(
        tasks::list_tasks_for_job(&pool, job_id)
            .await
            .unwrap()
            .is_empty()
    );

    db.teardown().await;
}

#[tokio::test]
async fn apply_supports_dynamic_extension_of_a_job() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let job_id = snowflake::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "dynamic").await.unwrap();

    let seed = create_task("pkg.seed", json!({}));
    ctx.apply(&[seed.node()], job_id).await.unwrap();

    // A later apply hangs a new task off the already-persisted one.
    let follow = create_task("pkg.follow", json!({}));
    follow.after(&seed);
    ctx.apply(&[follow.node()], job_id).await.unwrap();

    let edges = dependencies::list_for_next(&pool, follow.id().unwrap(), DepKind::Task)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].previous_id, seed.id().unwrap());

    db.teardown().await;
}

#[tokio::test]
async fn apply_rejects_edges_to_unapplied_items() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let job_id = snowflake::get_snowflake_id().unwrap();
    jobs::insert_job(&pool, job_id, "dangling").await.unwrap();

    let ghost = create_task("pkg.ghost", json!({}));
    let t = create_task("pkg.t", json!({}));
    t.after(&ghost);

    // ghost is neither applied nor included in the fragment.
    assert!(ctx.apply(&[t.node()], job_id).await.is_err());

    db.teardown().await;
}

#[tokio::test]
async fn create_job_persists_job_and_entry_task() {
    let db = TestDb::new().await;
    let pool = db.pool().clone();
    let ctx = OrchContext::from_pool(pool.clone());

    let (job, entry) = ctx.create_job("basic", "pkg.task1").await.unwrap();

    assert_eq!(job.name, "basic");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());

    let rows = tasks::list_tasks_for_job(&pool, job.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].entrypoint, "pkg.task1");
    assert_eq!(Some(rows[0].id), entry.id());

    db.teardown().await;
}
