//! Integration tests for the optimistic state queries: conditional run
//! and node transitions, latest-row loaders, barrier accounting, and
//! cascade ownership.

use alphred_db::models::{ArtifactType, BarrierStatus, DecisionType, NodeStatus, RunStatus};
use alphred_db::queries::artifacts::{self, NewPhaseArtifact};
use alphred_db::queries::barriers::{self, NewRunJoinBarrier};
use alphred_db::queries::decisions::{self, NewRoutingDecision};
use alphred_db::queries::{nodes, runs};
use alphred_test_utils::{add_agent_node, create_test_db, create_test_run};
use chrono::Utc;

#[tokio::test]
async fn run_transition_is_optimistic() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;

    let rows = runs::transition_run_status(
        &pool,
        run.id,
        RunStatus::Pending,
        RunStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // The same precondition no longer holds.
    let rows = runs::transition_run_status(
        &pool,
        run.id,
        RunStatus::Pending,
        RunStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    let run = runs::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.started_at.is_some());
}

#[tokio::test]
async fn claim_races_see_exactly_one_winner() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "solo", 1).await;

    let first = nodes::claim_node(&pool, node.id, Utc::now()).await.unwrap();
    let second = nodes::claim_node(&pool, node.id, Utc::now()).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 0);

    let node = nodes::get_node(&pool, node.id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Running);
    assert!(node.started_at.is_some());
    assert!(node.completed_at.is_none());
}

#[tokio::test]
async fn retry_increments_attempt_and_clears_timestamps() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "flaky", 1).await;

    nodes::claim_node(&pool, node.id, Utc::now()).await.unwrap();
    nodes::finish_node(&pool, node.id, NodeStatus::Failed, Utc::now())
        .await
        .unwrap();

    let rows = nodes::retry_node_to_pending(&pool, node.id, 1).await.unwrap();
    assert_eq!(rows, 1);

    let node = nodes::get_node(&pool, node.id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.attempt, 2);
    assert!(node.started_at.is_none());
    assert!(node.completed_at.is_none());

    // Stale attempt value fails the precondition.
    let rows = nodes::retry_node_to_pending(&pool, node.id, 1).await.unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn requeue_for_new_attempt_applies_to_completed_only_once() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "looped", 1).await;

    nodes::claim_node(&pool, node.id, Utc::now()).await.unwrap();
    nodes::finish_node(&pool, node.id, NodeStatus::Completed, Utc::now())
        .await
        .unwrap();

    let rows = nodes::requeue_node_for_new_attempt(&pool, node.id, 1).await.unwrap();
    assert_eq!(rows, 1);
    let node = nodes::get_node(&pool, node.id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.attempt, 2);

    // Pending nodes are not requeueable.
    let rows = nodes::requeue_node_for_new_attempt(&pool, node.id, 2).await.unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn latest_decision_per_node_wins() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "a", 1).await;

    for decision_type in [DecisionType::ChangesRequested, DecisionType::Approved] {
        decisions::insert_decision(
            &pool,
            &NewRoutingDecision {
                workflow_run_id: run.id,
                run_node_id: node.id,
                decision_type,
                attempt: 1,
                raw_output: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
    }

    let latest = decisions::latest_decisions_for_run(&pool, run.id).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].decision_type, DecisionType::Approved);

    let history = decisions::list_decisions_for_node(&pool, run.id, node.id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].decision_type, DecisionType::ChangesRequested);
    assert_eq!(history[1].decision_type, DecisionType::Approved);
}

#[tokio::test]
async fn latest_report_ignores_logs_and_notes() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "a", 1).await;

    for (artifact_type, content) in [
        (ArtifactType::Report, "first report"),
        (ArtifactType::Log, "a failure log"),
        (ArtifactType::Note, "a note"),
    ] {
        artifacts::insert_artifact(
            &pool,
            &NewPhaseArtifact {
                workflow_run_id: run.id,
                run_node_id: node.id,
                artifact_type,
                content_type: "text/plain".to_string(),
                content: content.to_string(),
                metadata: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
    }

    let report = artifacts::latest_report_for_node(&pool, node.id)
        .await
        .unwrap()
        .expect("report should exist");
    assert_eq!(report.content, "first report");

    // The latest artifact of any type is the note.
    let latest = artifacts::latest_artifacts_for_run(&pool, run.id).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].artifact_type, ArtifactType::Note);
}

#[tokio::test]
async fn retry_summary_lookup_by_source_attempt() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "a", 1).await;

    artifacts::insert_artifact(
        &pool,
        &NewPhaseArtifact {
            workflow_run_id: run.id,
            run_node_id: node.id,
            artifact_type: ArtifactType::Note,
            content_type: "text/plain".to_string(),
            content: "attempt 1 timed out".to_string(),
            metadata: serde_json::json!({
                "kind": artifacts::NOTE_KIND_RETRY_FAILURE_SUMMARY,
                "source_attempt": 1,
            }),
        },
    )
    .await
    .unwrap();

    let summary = artifacts::retry_summary_for_attempt(&pool, node.id, 1)
        .await
        .unwrap();
    assert!(summary.is_some());
    assert_eq!(summary.unwrap().content, "attempt 1 timed out");

    let missing = artifacts::retry_summary_for_attempt(&pool, node.id, 2)
        .await
        .unwrap();
    assert!(missing.is_none());
}

async fn insert_report(pool: &sqlx::SqlitePool, run_id: i64, node_id: i64) -> i64 {
    artifacts::insert_artifact(
        pool,
        &NewPhaseArtifact {
            workflow_run_id: run_id,
            run_node_id: node_id,
            artifact_type: ArtifactType::Report,
            content_type: "text/plain".to_string(),
            content: "spawn batch".to_string(),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn barrier_counters_flip_to_ready_on_last_child() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let spawner = add_agent_node(&pool, run.id, "spawner", 1).await;
    let join = add_agent_node(&pool, run.id, "join", 2).await;
    let report_id = insert_report(&pool, run.id, spawner.id).await;

    let barrier = barriers::insert_barrier(
        &pool,
        &NewRunJoinBarrier {
            workflow_run_id: run.id,
            spawner_run_node_id: spawner.id,
            join_run_node_id: join.id,
            spawn_source_artifact_id: report_id,
            expected_children: 2,
        },
    )
    .await
    .unwrap();
    assert_eq!(barrier.status, BarrierStatus::Pending);

    let rows = barriers::record_child_terminal(&pool, &barrier, true).await.unwrap();
    assert_eq!(rows, 1);
    let barrier = barriers::get_barrier(&pool, barrier.id).await.unwrap().unwrap();
    assert_eq!(barrier.terminal_children, 1);
    assert_eq!(barrier.completed_children, 1);
    assert_eq!(barrier.status, BarrierStatus::Pending);

    let rows = barriers::record_child_terminal(&pool, &barrier, false).await.unwrap();
    assert_eq!(rows, 1);
    let barrier = barriers::get_barrier(&pool, barrier.id).await.unwrap().unwrap();
    assert_eq!(barrier.terminal_children, 2);
    assert_eq!(barrier.failed_children, 1);
    assert_eq!(barrier.status, BarrierStatus::Ready);

    // A stale snapshot cannot double-count.
    let stale = barriers::record_child_terminal(&pool, &barrier, true).await;
    // terminal_children already equals expected; the CHECK constraint or
    // the optimistic WHERE keeps the row untouched.
    match stale {
        Ok(rows) => assert_eq!(rows, 0),
        Err(_) => {}
    }
}

#[tokio::test]
async fn barrier_reopen_and_release() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let spawner = add_agent_node(&pool, run.id, "spawner", 1).await;
    let join = add_agent_node(&pool, run.id, "join", 2).await;
    let report_id = insert_report(&pool, run.id, spawner.id).await;

    let barrier = barriers::insert_barrier(
        &pool,
        &NewRunJoinBarrier {
            workflow_run_id: run.id,
            spawner_run_node_id: spawner.id,
            join_run_node_id: join.id,
            spawn_source_artifact_id: report_id,
            expected_children: 1,
        },
    )
    .await
    .unwrap();

    barriers::record_child_terminal(&pool, &barrier, false).await.unwrap();
    let ready = barriers::get_barrier(&pool, barrier.id).await.unwrap().unwrap();
    assert_eq!(ready.status, BarrierStatus::Ready);

    // Reopen after the failed child is retried.
    let rows = barriers::reopen_barrier(&pool, &ready).await.unwrap();
    assert_eq!(rows, 1);
    let reopened = barriers::get_barrier(&pool, barrier.id).await.unwrap().unwrap();
    assert_eq!(reopened.status, BarrierStatus::Pending);
    assert_eq!(reopened.terminal_children, 0);
    assert_eq!(reopened.failed_children, 0);

    // Count the retried child as completed, then release.
    barriers::record_child_terminal(&pool, &reopened, true).await.unwrap();
    let rows = barriers::release_barrier(&pool, barrier.id).await.unwrap();
    assert_eq!(rows, 1);
    let released = barriers::get_barrier(&pool, barrier.id).await.unwrap().unwrap();
    assert_eq!(released.status, BarrierStatus::Released);

    // Release is optimistic on `ready`.
    let rows = barriers::release_barrier(&pool, barrier.id).await.unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn duplicate_spawn_source_artifact_rejected() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let spawner = add_agent_node(&pool, run.id, "spawner", 1).await;
    let join = add_agent_node(&pool, run.id, "join", 2).await;
    let report_id = insert_report(&pool, run.id, spawner.id).await;

    let new = NewRunJoinBarrier {
        workflow_run_id: run.id,
        spawner_run_node_id: spawner.id,
        join_run_node_id: join.id,
        spawn_source_artifact_id: report_id,
        expected_children: 2,
    };
    barriers::insert_barrier(&pool, &new).await.unwrap();

    let duplicate = barriers::insert_barrier(&pool, &new).await;
    assert!(duplicate.is_err(), "unique(spawn_source_artifact_id) should reject");
}

#[tokio::test]
async fn deleting_a_run_cascades_to_children() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let node = add_agent_node(&pool, run.id, "a", 1).await;
    insert_report(&pool, run.id, node.id).await;
    decisions::insert_decision(
        &pool,
        &NewRoutingDecision {
            workflow_run_id: run.id,
            run_node_id: node.id,
            decision_type: DecisionType::Approved,
            attempt: 1,
            raw_output: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let rows = runs::delete_run(&pool, run.id).await.unwrap();
    assert_eq!(rows, 1);

    assert!(nodes::get_node(&pool, node.id).await.unwrap().is_none());
    let artifacts_left = artifacts::list_artifacts_for_node(&pool, node.id).await.unwrap();
    assert!(artifacts_left.is_empty());
    let decisions_left = decisions::list_decisions_for_node(&pool, run.id, node.id)
        .await
        .unwrap();
    assert!(decisions_left.is_empty());
}

#[tokio::test]
async fn run_progress_counts_by_status() {
    let (pool, _dir) = create_test_db().await;
    let run = create_test_run(&pool).await;
    let a = add_agent_node(&pool, run.id, "a", 1).await;
    add_agent_node(&pool, run.id, "b", 2).await;

    nodes::claim_node(&pool, a.id, Utc::now()).await.unwrap();
    nodes::finish_node(&pool, a.id, NodeStatus::Completed, Utc::now())
        .await
        .unwrap();

    let progress = nodes::get_run_progress(&pool, run.id).await.unwrap();
    assert_eq!(progress.total, 2);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.failed, 0);
}
