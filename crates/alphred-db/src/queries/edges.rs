//! Database query functions for the `run_edges` table.

use anyhow::{Context, Result};
use sqlx::SqliteExecutor;

use crate::models::{EdgeKind, RouteOn, RunEdge};

/// Parameters for inserting a new run edge row.
#[derive(Debug, Clone)]
pub struct NewRunEdge {
    pub workflow_run_id: i64,
    pub source_run_node_id: i64,
    pub target_run_node_id: i64,
    pub route_on: RouteOn,
    pub priority: i64,
    pub auto: bool,
    pub guard_expression: Option<String>,
    pub edge_kind: EdgeKind,
}

/// Insert a new run edge row. Returns the inserted edge.
pub async fn insert_edge<'e, E>(ex: E, new: &NewRunEdge) -> Result<RunEdge>
where
    E: SqliteExecutor<'e>,
{
    let edge = sqlx::query_as::<_, RunEdge>(
        "INSERT INTO run_edges \
         (workflow_run_id, source_run_node_id, target_run_node_id, route_on, \
          priority, auto, guard_expression, edge_kind) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.workflow_run_id)
    .bind(new.source_run_node_id)
    .bind(new.target_run_node_id)
    .bind(new.route_on)
    .bind(new.priority)
    .bind(new.auto)
    .bind(&new.guard_expression)
    .bind(new.edge_kind)
    .fetch_one(ex)
    .await
    .context("failed to insert run edge")?;

    Ok(edge)
}

/// List all edges of a run in selection order:
/// `(source_run_node_id, route_on, priority, target_run_node_id, id)`.
pub async fn list_edges_for_run<'e, E>(ex: E, workflow_run_id: i64) -> Result<Vec<RunEdge>>
where
    E: SqliteExecutor<'e>,
{
    let edges = sqlx::query_as::<_, RunEdge>(
        "SELECT * FROM run_edges \
         WHERE workflow_run_id = ? \
         ORDER BY source_run_node_id ASC, route_on ASC, priority ASC, \
                  target_run_node_id ASC, id ASC",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to list run edges")?;

    Ok(edges)
}

/// Highest priority among a source node's success edges, or `None` when it
/// has no success edges yet. Dynamic fan-out edges must be inserted above
/// this value so the static routes keep winning single-route selection.
pub async fn max_success_priority<'e, E>(ex: E, source_run_node_id: i64) -> Result<Option<i64>>
where
    E: SqliteExecutor<'e>,
{
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(priority) FROM run_edges \
         WHERE source_run_node_id = ? AND route_on = 'success'",
    )
    .bind(source_run_node_id)
    .fetch_one(ex)
    .await
    .context("failed to query max success-edge priority")?;

    Ok(row.0)
}
