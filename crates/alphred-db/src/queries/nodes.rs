//! Database query functions for the `run_nodes` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::SqliteExecutor;

use crate::models::{NodeRole, NodeStatus, NodeType, RunNode};

/// Parameters for inserting a new run node row.
///
/// Status, attempt, and timestamps take their server defaults
/// (`pending`, 1, unset).
#[derive(Debug, Clone)]
pub struct NewRunNode {
    pub workflow_run_id: i64,
    pub tree_node_id: i64,
    pub node_key: String,
    pub node_role: NodeRole,
    pub sequence_index: i64,
    pub sequence_path: String,
    pub lineage_depth: i64,
    pub spawner_node_id: Option<i64>,
    pub join_node_id: Option<i64>,
    pub max_retries: i64,
    pub max_children: i64,
    pub node_type: NodeType,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
    pub prompt_content_type: String,
}

/// Insert a new run node row. Returns the inserted node with
/// server-generated defaults (id, status, attempt, created_at).
pub async fn insert_node<'e, E>(ex: E, new: &NewRunNode) -> Result<RunNode>
where
    E: SqliteExecutor<'e>,
{
    let node = sqlx::query_as::<_, RunNode>(
        "INSERT INTO run_nodes \
         (workflow_run_id, tree_node_id, node_key, node_role, sequence_index, \
          sequence_path, lineage_depth, spawner_node_id, join_node_id, \
          max_retries, max_children, node_type, provider, model, prompt, \
          prompt_content_type) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.workflow_run_id)
    .bind(new.tree_node_id)
    .bind(&new.node_key)
    .bind(new.node_role)
    .bind(new.sequence_index)
    .bind(&new.sequence_path)
    .bind(new.lineage_depth)
    .bind(new.spawner_node_id)
    .bind(new.join_node_id)
    .bind(new.max_retries)
    .bind(new.max_children)
    .bind(new.node_type)
    .bind(&new.provider)
    .bind(&new.model)
    .bind(&new.prompt)
    .bind(&new.prompt_content_type)
    .fetch_one(ex)
    .await
    .with_context(|| format!("failed to insert run node {}", new.node_key))?;

    Ok(node)
}

/// Fetch a single run node by ID.
pub async fn get_node<'e, E>(ex: E, id: i64) -> Result<Option<RunNode>>
where
    E: SqliteExecutor<'e>,
{
    let node = sqlx::query_as::<_, RunNode>("SELECT * FROM run_nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch run node")?;

    Ok(node)
}

/// Fetch a run node by its key within a run.
pub async fn get_node_by_key<'e, E>(
    ex: E,
    workflow_run_id: i64,
    node_key: &str,
) -> Result<Option<RunNode>>
where
    E: SqliteExecutor<'e>,
{
    let node = sqlx::query_as::<_, RunNode>(
        "SELECT * FROM run_nodes WHERE workflow_run_id = ? AND node_key = ?",
    )
    .bind(workflow_run_id)
    .bind(node_key)
    .fetch_optional(ex)
    .await
    .context("failed to fetch run node by key")?;

    Ok(node)
}

/// List all nodes of a run in graph selection order:
/// `(sequence_path, sequence_index, node_key, id)` ascending.
pub async fn list_nodes_for_run<'e, E>(ex: E, workflow_run_id: i64) -> Result<Vec<RunNode>>
where
    E: SqliteExecutor<'e>,
{
    let nodes = sqlx::query_as::<_, RunNode>(
        "SELECT * FROM run_nodes \
         WHERE workflow_run_id = ? \
         ORDER BY sequence_path ASC, sequence_index ASC, node_key ASC, id ASC",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to list run nodes")?;

    Ok(nodes)
}

/// Claim a node for execution: `pending -> running`.
///
/// Sets `started_at` and clears `completed_at`. Optimistically locked on
/// the `pending` status; returns the number of rows affected.
pub async fn claim_node<'e, E>(ex: E, node_id: i64, occurred_at: DateTime<Utc>) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_nodes \
         SET status = 'running', started_at = ?, completed_at = NULL \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(occurred_at)
    .bind(node_id)
    .execute(ex)
    .await
    .context("failed to claim run node")?;

    Ok(result.rows_affected())
}

/// Finish a running node: `running -> completed|failed`.
///
/// Sets `completed_at`. Returns the number of rows affected.
pub async fn finish_node<'e, E>(
    ex: E,
    node_id: i64,
    to: NodeStatus,
    occurred_at: DateTime<Utc>,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_nodes \
         SET status = ?, completed_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(to)
    .bind(occurred_at)
    .bind(node_id)
    .execute(ex)
    .await
    .context("failed to finish run node")?;

    Ok(result.rows_affected())
}

/// Mark an unreachable pending node as skipped, setting `completed_at`.
pub async fn skip_node<'e, E>(ex: E, node_id: i64, occurred_at: DateTime<Utc>) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_nodes \
         SET status = 'skipped', completed_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(occurred_at)
    .bind(node_id)
    .execute(ex)
    .await
    .context("failed to skip run node")?;

    Ok(result.rows_affected())
}

/// Reset a failed node back to `pending` with an incremented attempt
/// counter and cleared timestamps. Optimistically locked on both status
/// and the current attempt value.
pub async fn retry_node_to_pending<'e, E>(
    ex: E,
    node_id: i64,
    current_attempt: i64,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_nodes \
         SET status = 'pending', \
             attempt = attempt + 1, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = ? AND status = 'failed' AND attempt = ?",
    )
    .bind(node_id)
    .bind(current_attempt)
    .execute(ex)
    .await
    .context("failed to retry run node to pending")?;

    Ok(result.rows_affected())
}

/// Requeue a terminal node for a fresh attempt when a loop route selects
/// it again: `completed|skipped -> pending`, incrementing the attempt
/// counter and clearing both timestamps. Optimistically locked on the
/// observed attempt.
pub async fn requeue_node_for_new_attempt<'e, E>(
    ex: E,
    node_id: i64,
    current_attempt: i64,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_nodes \
         SET status = 'pending', \
             attempt = attempt + 1, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = ? AND status IN ('completed', 'skipped') AND attempt = ?",
    )
    .bind(node_id)
    .bind(current_attempt)
    .execute(ex)
    .await
    .context("failed to requeue run node for new attempt")?;

    Ok(result.rows_affected())
}

/// Requeue a terminal node back to `pending` without touching the attempt
/// counter (used when a released join must run again after a child retry).
pub async fn requeue_node_to_pending<'e, E>(
    ex: E,
    node_id: i64,
    from: NodeStatus,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_nodes \
         SET status = 'pending', started_at = NULL, completed_at = NULL \
         WHERE id = ? AND status = ?",
    )
    .bind(node_id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to requeue run node to pending")?;

    Ok(result.rows_affected())
}

/// Store the execution metadata (context manifest) for a node.
pub async fn set_execution_metadata<'e, E>(
    ex: E,
    node_id: i64,
    metadata: &JsonValue,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE run_nodes SET execution_metadata = ? WHERE id = ?")
        .bind(metadata)
        .bind(node_id)
        .execute(ex)
        .await
        .context("failed to set run node execution metadata")?;

    Ok(result.rows_affected())
}

/// Reset nodes stuck in `running` back to `failed` so they can be retried
/// or resolved by the normal terminal logic.
///
/// This is used for restart recovery: if the process crashes mid-step,
/// the claimed node is left in limbo. Returns the nodes that were reset.
pub async fn reset_orphaned_nodes<'e, E>(ex: E, workflow_run_id: i64) -> Result<Vec<RunNode>>
where
    E: SqliteExecutor<'e>,
{
    let nodes = sqlx::query_as::<_, RunNode>(
        "UPDATE run_nodes \
         SET status = 'failed', \
             completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
         WHERE workflow_run_id = ? AND status = 'running' \
         RETURNING *",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to reset orphaned run nodes")?;

    Ok(nodes)
}

/// Status counts for a run's nodes.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total: i64,
}

/// Get a summary of node counts by status for a given run.
pub async fn get_run_progress<'e, E>(ex: E, workflow_run_id: i64) -> Result<RunProgress>
where
    E: SqliteExecutor<'e>,
{
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) as cnt \
         FROM run_nodes \
         WHERE workflow_run_id = ? \
         GROUP BY status",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to get run progress")?;

    let mut progress = RunProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "running" => progress.running = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "skipped" => progress.skipped = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
