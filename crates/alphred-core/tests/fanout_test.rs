//! End-to-end: dynamic fan-out with join barriers.

use alphred_core::executor::{self, StepOutcome};
use alphred_core::provider::ProviderError;
use alphred_core::{controller, fanout, EngineError};
use alphred_db::models::{BarrierStatus, EdgeKind, NodeStatus, RunStatus};
use alphred_db::queries::artifacts::{self, NewPhaseArtifact};
use alphred_db::queries::{barriers, edges, nodes, runs};
use alphred_test_utils as util;
use alphred_test_utils::ScriptedProvider;

fn spawn_report(keys: &[&str]) -> String {
    let subtasks: Vec<serde_json::Value> = keys
        .iter()
        .map(|k| {
            serde_json::json!({
                "nodeKey": k,
                "title": format!("shard {k}"),
                "prompt": format!("work on shard {k}"),
            })
        })
        .collect();
    serde_json::json!({ "summary": "split", "subtasks": subtasks }).to_string()
}

async fn fanout_graph(pool: &sqlx::SqlitePool, max_children: i64) -> (i64, i64, i64) {
    let run = util::create_test_run(pool).await;
    let spawner = util::add_spawner_node(pool, run.id, "split", 1, max_children).await;
    let join = util::add_join_node(pool, run.id, "merge", 2).await;
    util::add_success_edge(pool, run.id, spawner.id, join.id, 0, None, true).await;
    (run.id, spawner.id, join.id)
}

#[tokio::test]
async fn spawner_materialises_children_edges_and_barrier() {
    let (pool, _dir) = util::create_test_db().await;
    let (run_id, spawner_id, join_id) = fanout_graph(&pool, 4).await;

    let provider = ScriptedProvider::new("scripted");
    provider.push_script(util::result_script(&spawn_report(&["x", "y", "z"]), None));
    let ws = tempfile::tempdir().unwrap();
    let deps = util::test_deps(provider, ws.path());

    let outcome = executor::execute_next_runnable_node(&pool, run_id, &deps).await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Executed {
            node_status: NodeStatus::Completed,
            run_status: RunStatus::Running,
        }
    );

    let all_nodes = nodes::list_nodes_for_run(&pool, run_id).await.unwrap();
    let children: Vec<_> = all_nodes
        .iter()
        .filter(|n| n.spawner_node_id == Some(spawner_id))
        .collect();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.join_node_id, Some(join_id));
        assert_eq!(child.status, NodeStatus::Pending);
        assert!(child.sequence_path.starts_with("0001."));
        assert_eq!(child.lineage_depth, 1);
    }

    let all_edges = edges::list_edges_for_run(&pool, run_id).await.unwrap();
    let to_children = all_edges
        .iter()
        .filter(|e| e.edge_kind == EdgeKind::DynamicSpawnerToChild)
        .count();
    let to_join = all_edges
        .iter()
        .filter(|e| e.edge_kind == EdgeKind::DynamicChildToJoin)
        .count();
    assert_eq!(to_children, 3);
    assert_eq!(to_join, 3);

    // Dynamic priorities sit strictly above the static spawner->join edge.
    let static_priority = all_edges
        .iter()
        .filter(|e| e.edge_kind == EdgeKind::Tree && e.source_run_node_id == spawner_id)
        .map(|e| e.priority)
        .max()
        .unwrap();
    for edge in all_edges
        .iter()
        .filter(|e| e.edge_kind == EdgeKind::DynamicSpawnerToChild)
    {
        assert!(edge.priority > static_priority);
    }

    let all_barriers = barriers::list_barriers_for_run(&pool, run_id).await.unwrap();
    assert_eq!(all_barriers.len(), 1);
    let barrier = &all_barriers[0];
    assert_eq!(barrier.expected_children, 3);
    assert_eq!(barrier.terminal_children, 0);
    assert_eq!(barrier.status, BarrierStatus::Pending);
}

#[tokio::test]
async fn join_waits_for_all_children_then_releases() {
    let (pool, _dir) = util::create_test_db().await;
    let (run_id, spawner_id, join_id) = fanout_graph(&pool, 4).await;

    let provider = ScriptedProvider::new("scripted");
    provider.push_script(util::result_script(&spawn_report(&["x", "y", "z"]), None));
    for key in ["x", "y", "z"] {
        provider.push_script(util::result_script(&format!("report {key}"), Some("approved")));
    }
    provider.push_script(util::result_script("merged", Some("approved")));
    let ws = tempfile::tempdir().unwrap();
    let deps = util::test_deps(provider, ws.path());

    // Spawner step.
    executor::execute_next_runnable_node(&pool, run_id, &deps).await.unwrap();

    // Children run one per step; the join stays pending until the last
    // child lands and the barrier flips to ready.
    for expected_terminal in 1..=3 {
        executor::execute_next_runnable_node(&pool, run_id, &deps).await.unwrap();
        let all = barriers::list_barriers_for_run(&pool, run_id).await.unwrap();
        let barrier = &all[0];
        assert_eq!(barrier.terminal_children, expected_terminal);
        assert_eq!(barrier.completed_children, expected_terminal);
        let join = nodes::get_node(&pool, join_id).await.unwrap().unwrap();
        if expected_terminal < 3 {
            assert_eq!(barrier.status, BarrierStatus::Pending);
            assert_eq!(join.status, NodeStatus::Pending);
        } else {
            assert_eq!(barrier.status, BarrierStatus::Ready);
        }
    }

    // Join step: the barrier is released atomically with the claim.
    executor::execute_next_runnable_node(&pool, run_id, &deps).await.unwrap();
    let all = barriers::list_barriers_for_run(&pool, run_id).await.unwrap();
    let barrier = &all[0];
    assert_eq!(barrier.status, BarrierStatus::Released);
    let join = nodes::get_node(&pool, join_id).await.unwrap().unwrap();
    assert_eq!(join.status, NodeStatus::Completed);

    // The join's context is the spawner's report plus the three child
    // reports, in sequence order.
    let manifest = join.execution_metadata.expect("manifest persisted");
    assert_eq!(manifest["included_count"], 4);

    // Final step resolves the run.
    let outcome = executor::execute_next_runnable_node(&pool, run_id, &deps).await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::RunTerminal {
            run_status: RunStatus::Completed
        }
    );
    let _ = spawner_id;
}

#[tokio::test]
async fn failed_child_retry_reopens_accounting() {
    let (pool, _dir) = util::create_test_db().await;
    let run = util::create_test_run(&pool).await;
    let spawner = util::add_spawner_node(&pool, run.id, "split", 1, 4).await;
    // Children inherit the spawner's retry budget.
    sqlx::query("UPDATE run_nodes SET max_retries = 1 WHERE id = ?")
        .bind(spawner.id)
        .execute(&pool)
        .await
        .unwrap();
    let join = util::add_join_node(&pool, run.id, "merge", 2).await;
    util::add_success_edge(&pool, run.id, spawner.id, join.id, 0, None, true).await;

    let provider = ScriptedProvider::new("scripted");
    provider.push_script(util::result_script(&spawn_report(&["x", "y", "z"]), None));
    provider.push_script(util::result_script("report x", Some("approved")));
    provider.push_script(util::failure_script(ProviderError::classify(
        Some(504),
        None,
        "shard y timed out",
    )));
    provider.push_script(util::result_script("report z", Some("approved")));
    provider.push_script(util::result_script("report y, attempt 2", Some("approved")));
    provider.push_script(util::result_script("merged", Some("approved")));
    let ws = tempfile::tempdir().unwrap();
    let deps = util::test_deps(provider, ws.path());

    // Spawner, x, y (fails retryably).
    for _ in 0..3 {
        executor::execute_next_runnable_node(&pool, run.id, &deps).await.unwrap();
    }
    let y = nodes::get_node_by_key(&pool, run.id, "y").await.unwrap().unwrap();
    assert_eq!(y.status, NodeStatus::Pending);
    assert_eq!(y.attempt, 2);
    let all = barriers::list_barriers_for_run(&pool, run.id).await.unwrap();
    let barrier = &all[0];
    assert_eq!(barrier.terminal_children, 1);
    assert_eq!(barrier.failed_children, 0);
    assert_eq!(barrier.status, BarrierStatus::Pending);

    // z, then y's second attempt, then the join, then resolution.
    let completion = controller::execute_run(&pool, run.id, &deps, 10).await.unwrap();
    assert_eq!(
        completion.outcome,
        StepOutcome::RunTerminal {
            run_status: RunStatus::Completed
        }
    );

    let y = nodes::get_node_by_key(&pool, run.id, "y").await.unwrap().unwrap();
    assert_eq!(y.status, NodeStatus::Completed);
    assert_eq!(y.attempt, 2);
    let note = artifacts::retry_summary_for_attempt(&pool, y.id, 1)
        .await
        .unwrap();
    assert!(note.is_some(), "retry summary for shard y's first attempt");

    let all = barriers::list_barriers_for_run(&pool, run.id).await.unwrap();
    let barrier = &all[0];
    assert_eq!(barrier.status, BarrierStatus::Released);
    assert_eq!(barrier.terminal_children, 3);
    assert_eq!(barrier.completed_children, 3);
    assert_eq!(barrier.failed_children, 0);
}

#[tokio::test]
async fn second_batch_rejected_while_barrier_active() {
    let (pool, _dir) = util::create_test_db().await;
    let (run_id, spawner_id, join_id) = fanout_graph(&pool, 4).await;
    let spawner = nodes::get_node(&pool, spawner_id).await.unwrap().unwrap();
    let join = nodes::get_node(&pool, join_id).await.unwrap().unwrap();

    let report = artifacts::insert_artifact(
        &pool,
        &NewPhaseArtifact {
            workflow_run_id: run_id,
            run_node_id: spawner_id,
            artifact_type: alphred_db::models::ArtifactType::Report,
            content_type: "application/json".to_string(),
            content: spawn_report(&["x", "y"]),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let subtasks = fanout::parse_subtasks(&report.content).unwrap();
    fanout::apply_spawn(&pool, &spawner, &join, &report, &subtasks).await.unwrap();

    // A second report while the first batch is still accounting.
    let second_report = artifacts::insert_artifact(
        &pool,
        &NewPhaseArtifact {
            workflow_run_id: run_id,
            run_node_id: spawner_id,
            artifact_type: alphred_db::models::ArtifactType::Report,
            content_type: "application/json".to_string(),
            content: spawn_report(&["p", "q"]),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    let subtasks = fanout::parse_subtasks(&second_report.content).unwrap();
    let err = fanout::apply_spawn(&pool, &spawner, &join, &second_report, &subtasks)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateSpawnBatch { .. }));

    // No extra children or barriers appeared.
    let all_nodes = nodes::list_nodes_for_run(&pool, run_id).await.unwrap();
    let children = all_nodes
        .iter()
        .filter(|n| n.spawner_node_id == Some(spawner_id))
        .count();
    assert_eq!(children, 2);
    assert_eq!(
        barriers::list_barriers_for_run(&pool, run_id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn batch_over_child_cap_rejected() {
    let (pool, _dir) = util::create_test_db().await;
    let (run_id, spawner_id, join_id) = fanout_graph(&pool, 2).await;
    let spawner = nodes::get_node(&pool, spawner_id).await.unwrap().unwrap();
    let join = nodes::get_node(&pool, join_id).await.unwrap().unwrap();

    let report = artifacts::insert_artifact(
        &pool,
        &NewPhaseArtifact {
            workflow_run_id: run_id,
            run_node_id: spawner_id,
            artifact_type: alphred_db::models::ArtifactType::Report,
            content_type: "application/json".to_string(),
            content: spawn_report(&["a", "b", "c"]),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    let subtasks = fanout::parse_subtasks(&report.content).unwrap();

    let err = fanout::apply_spawn(&pool, &spawner, &join, &report, &subtasks)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ChildLimitExceeded {
            declared: 3,
            max_children: 2,
            ..
        }
    ));

    // Exactly at the cap is fine.
    let at_cap = artifacts::insert_artifact(
        &pool,
        &NewPhaseArtifact {
            workflow_run_id: run_id,
            run_node_id: spawner_id,
            artifact_type: alphred_db::models::ArtifactType::Report,
            content_type: "application/json".to_string(),
            content: spawn_report(&["a", "b"]),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    let subtasks = fanout::parse_subtasks(&at_cap.content).unwrap();
    let outcome = fanout::apply_spawn(&pool, &spawner, &join, &at_cap, &subtasks)
        .await
        .unwrap();
    assert_eq!(outcome.children.len(), 2);
    assert_eq!(outcome.barrier.expected_children, 2);

    let run_row = runs::get_run(&pool, run_id).await.unwrap().unwrap();
    assert_eq!(run_row.status, RunStatus::Pending);
}
