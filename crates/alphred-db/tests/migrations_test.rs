//! Schema smoke tests: migrations apply cleanly and produce the
//! expected tables with their defaults.

use alphred_db::models::{RunStatus, WorkflowRun};
use alphred_db::queries::runs;
use alphred_test_utils::create_test_db;

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, _dir) = create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' \
         ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .expect("failed to list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    for expected in [
        "phase_artifacts",
        "routing_decisions",
        "run_edges",
        "run_join_barriers",
        "run_nodes",
        "workflow_runs",
    ] {
        assert!(names.contains(&expected), "missing table {expected}, got {names:?}");
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, _dir) = create_test_db().await;
    // Applying migrations again against the same database is a no-op.
    alphred_db::pool::apply_migrations(&pool)
        .await
        .expect("second migration pass should succeed");
}

#[tokio::test]
async fn new_run_has_pending_defaults() {
    let (pool, _dir) = create_test_db().await;
    let run: WorkflowRun = runs::insert_run(&pool, 42).await.expect("insert run");

    assert_eq!(run.workflow_tree_id, 42);
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.started_at.is_none());
    assert!(run.completed_at.is_none());
}

#[tokio::test]
async fn run_status_check_constraint_rejects_garbage() {
    let (pool, _dir) = create_test_db().await;
    let run = runs::insert_run(&pool, 1).await.unwrap();

    let result = sqlx::query("UPDATE workflow_runs SET status = 'exploded' WHERE id = ?")
        .bind(run.id)
        .execute(&pool)
        .await;
    assert!(result.is_err(), "CHECK constraint should reject unknown status");
}
