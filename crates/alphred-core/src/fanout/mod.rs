//! Dynamic fan-out and join barriers.
//!
//! A completed spawner's report may declare subtasks; this module
//! materialises the child nodes, dynamic edges, and the accounting
//! barrier in one transaction, advances barrier counters as children
//! reach terminal statuses, and reopens barriers when failed children
//! are retried.

use alphred_db::models::{
    BarrierStatus, EdgeKind, NodeRole, NodeType, PhaseArtifact, RouteOn, RunJoinBarrier, RunNode,
};
use alphred_db::queries::barriers::{self, NewRunJoinBarrier};
use alphred_db::queries::edges::{self, NewRunEdge};
use alphred_db::queries::nodes::{self, NewRunNode};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::guard::dispatch;

/// Top-level key under which a spawner report declares its subtasks.
pub const SUBTASKS_KEY: &str = "subtasks";

/// One declared subtask in a spawner's report payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDecl {
    #[serde(rename = "nodeKey")]
    pub node_key: String,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// Parse subtask declarations from a spawner report's content.
///
/// Content that is not JSON, or JSON without the `subtasks` key, declares
/// no fan-out and yields an empty list. A present but undecodable list is
/// an error (the spawner's prompt template promised a contract it broke).
pub fn parse_subtasks(content: &str) -> Result<Vec<SubtaskDecl>, String> {
    let Ok(value) = serde_json::from_str::<JsonValue>(content) else {
        return Ok(Vec::new());
    };
    let Some(raw) = value.get(SUBTASKS_KEY) else {
        return Ok(Vec::new());
    };
    let subtasks: Vec<SubtaskDecl> =
        serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;

    for subtask in &subtasks {
        if subtask.node_key.trim().is_empty() {
            return Err("subtask with empty nodeKey".to_string());
        }
    }
    let mut keys: Vec<&str> = subtasks.iter().map(|s| s.node_key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();
    if keys.len() != subtasks.len() {
        return Err("duplicate nodeKey in subtask batch".to_string());
    }

    Ok(subtasks)
}

/// Result of materialising a fan-out batch.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub children: Vec<RunNode>,
    pub barrier: RunJoinBarrier,
}

/// Materialise a fan-out batch from a completed spawner's report.
///
/// Within one transaction: refuse if a barrier for (spawner, join) is
/// still active, insert the child nodes, the dynamic edges, and the
/// barrier row. Dynamic spawner-to-child priorities start strictly above
/// the spawner's static success edges so the static spawner-to-join
/// route keeps winning single-route selection.
pub async fn apply_spawn(
    pool: &SqlitePool,
    spawner: &RunNode,
    join: &RunNode,
    report: &PhaseArtifact,
    subtasks: &[SubtaskDecl],
) -> Result<SpawnOutcome, EngineError> {
    if subtasks.len() as i64 > spawner.max_children {
        return Err(EngineError::ChildLimitExceeded {
            node_key: spawner.node_key.clone(),
            declared: subtasks.len(),
            max_children: spawner.max_children,
        });
    }

    let mut tx = pool.begin().await.context("begin spawn transaction")?;

    let active = barriers::active_barriers_for_pair(&mut *tx, spawner.id, join.id).await?;
    if let Some(existing) = active.first() {
        return Err(EngineError::DuplicateSpawnBatch {
            workflow_run_id: spawner.workflow_run_id,
            node_key: spawner.node_key.clone(),
            barrier_id: existing.id,
        });
    }

    let base_priority = edges::max_success_priority(&mut *tx, spawner.id)
        .await?
        .unwrap_or(0);

    let mut children = Vec::with_capacity(subtasks.len());
    for (index, subtask) in subtasks.iter().enumerate() {
        let child = nodes::insert_node(
            &mut *tx,
            &NewRunNode {
                workflow_run_id: spawner.workflow_run_id,
                tree_node_id: spawner.tree_node_id,
                node_key: subtask.node_key.clone(),
                node_role: NodeRole::Standard,
                sequence_index: index as i64,
                sequence_path: format!("{}.{:04}", spawner.sequence_path, index + 1),
                lineage_depth: spawner.lineage_depth + 1,
                spawner_node_id: Some(spawner.id),
                join_node_id: Some(join.id),
                max_retries: spawner.max_retries,
                max_children: 0,
                node_type: NodeType::Agent,
                provider: subtask.provider.clone().or_else(|| spawner.provider.clone()),
                model: subtask.model.clone().or_else(|| spawner.model.clone()),
                prompt: subtask.prompt.clone(),
                prompt_content_type: spawner.prompt_content_type.clone(),
            },
        )
        .await?;

        edges::insert_edge(
            &mut *tx,
            &NewRunEdge {
                workflow_run_id: spawner.workflow_run_id,
                source_run_node_id: spawner.id,
                target_run_node_id: child.id,
                route_on: RouteOn::Success,
                priority: base_priority + 1 + index as i64,
                auto: true,
                guard_expression: None,
                edge_kind: EdgeKind::DynamicSpawnerToChild,
            },
        )
        .await?;

        edges::insert_edge(
            &mut *tx,
            &NewRunEdge {
                workflow_run_id: spawner.workflow_run_id,
                source_run_node_id: child.id,
                target_run_node_id: join.id,
                route_on: RouteOn::Success,
                priority: 0,
                auto: true,
                guard_expression: None,
                edge_kind: EdgeKind::DynamicChildToJoin,
            },
        )
        .await?;

        children.push(child);
    }

    let barrier = barriers::insert_barrier(
        &mut *tx,
        &NewRunJoinBarrier {
            workflow_run_id: spawner.workflow_run_id,
            spawner_run_node_id: spawner.id,
            join_run_node_id: join.id,
            spawn_source_artifact_id: report.id,
            expected_children: subtasks.len() as i64,
        },
    )
    .await?;

    tx.commit().await.context("commit spawn transaction")?;

    info!(
        workflow_run_id = spawner.workflow_run_id,
        spawner = %spawner.node_key,
        join = %join.node_key,
        children = children.len(),
        barrier_id = barrier.id,
        "materialised fan-out batch"
    );

    Ok(SpawnOutcome { children, barrier })
}

/// Count a dynamic child reaching a terminal status against the active
/// barrier of its (spawner, join) pair.
///
/// Runs inside the same transaction that flips the child's status. Zero
/// active barriers is a defensive no-op; more than one is an invariant
/// violation that aborts the step without advancing counters.
pub async fn record_child_terminal(
    conn: &mut SqliteConnection,
    child: &RunNode,
    child_completed: bool,
) -> Result<(), EngineError> {
    let (Some(spawner_id), Some(join_id)) = (child.spawner_node_id, child.join_node_id) else {
        return Ok(());
    };

    let active = barriers::active_barriers_for_pair(&mut *conn, spawner_id, join_id).await?;
    match active.as_slice() {
        [] => {
            warn!(
                child = %child.node_key,
                spawner_id,
                join_id,
                "no active barrier for terminal child"
            );
            Ok(())
        }
        [barrier] => {
            let rows = barriers::record_child_terminal(&mut *conn, barrier, child_completed).await?;
            if rows != 1 {
                return Err(EngineError::Storage(anyhow::anyhow!(
                    "barrier {} concurrently modified while counting child {}",
                    barrier.id,
                    child.node_key
                )));
            }
            if barrier.terminal_children + 1 == barrier.expected_children {
                info!(
                    barrier_id = barrier.id,
                    join_id, "all children terminal, barrier ready"
                );
            }
            Ok(())
        }
        _ => {
            let spawner_key = nodes::get_node(&mut *conn, spawner_id)
                .await?
                .map(|n| n.node_key)
                .unwrap_or_else(|| spawner_id.to_string());
            Err(EngineError::MultipleActiveBarriers {
                workflow_run_id: child.workflow_run_id,
                node_key: spawner_key,
            })
        }
    }
}

/// Reopen the barrier after a failed dynamic child was reset to
/// `pending`, decrementing the terminal/failed counters. When the
/// barrier had already been `released`, the join is requeued to
/// `pending` so it waits for the retried child again.
pub async fn reopen_for_child(
    conn: &mut SqliteConnection,
    child: &RunNode,
) -> Result<(), EngineError> {
    let (Some(spawner_id), Some(join_id)) = (child.spawner_node_id, child.join_node_id) else {
        return Ok(());
    };

    let Some(barrier) = barriers::latest_barrier_for_pair(&mut *conn, spawner_id, join_id).await?
    else {
        return Ok(());
    };

    // Nothing to reopen when this child's failure was never counted.
    if barrier.failed_children == 0 || barrier.terminal_children == 0 {
        return Ok(());
    }

    let was_released = barrier.status == BarrierStatus::Released;
    let rows = barriers::reopen_barrier(&mut *conn, &barrier).await?;
    if rows != 1 {
        return Err(EngineError::Storage(anyhow::anyhow!(
            "barrier {} concurrently modified while reopening for child {}",
            barrier.id,
            child.node_key
        )));
    }
    info!(
        barrier_id = barrier.id,
        child = %child.node_key,
        was_released,
        "reopened barrier for retried child"
    );

    if was_released {
        if let Some(join) = nodes::get_node(&mut *conn, join_id).await? {
            if join.status.is_terminal() {
                dispatch::requeue_node(&mut *conn, &join).await?;
                info!(join = %join.node_key, "requeued join behind reopened barrier");
            }
        }
    }

    Ok(())
}
