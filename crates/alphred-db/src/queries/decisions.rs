//! Database query functions for the `routing_decisions` table.

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sqlx::SqliteExecutor;

use crate::models::{DecisionType, RoutingDecision};

/// Parameters for inserting a new routing decision row.
#[derive(Debug, Clone)]
pub struct NewRoutingDecision {
    pub workflow_run_id: i64,
    pub run_node_id: i64,
    pub decision_type: DecisionType,
    pub attempt: i64,
    pub raw_output: JsonValue,
}

/// Insert a new routing decision row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_decision<'e, E>(ex: E, new: &NewRoutingDecision) -> Result<RoutingDecision>
where
    E: SqliteExecutor<'e>,
{
    let decision = sqlx::query_as::<_, RoutingDecision>(
        "INSERT INTO routing_decisions \
         (workflow_run_id, run_node_id, decision_type, attempt, raw_output) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.workflow_run_id)
    .bind(new.run_node_id)
    .bind(new.decision_type)
    .bind(new.attempt)
    .bind(&new.raw_output)
    .fetch_one(ex)
    .await
    .with_context(|| {
        format!(
            "failed to insert routing decision for node {} attempt {}",
            new.run_node_id, new.attempt
        )
    })?;

    Ok(decision)
}

/// The latest decision per run node of a run (highest id wins, matching
/// insertion order).
pub async fn latest_decisions_for_run<'e, E>(
    ex: E,
    workflow_run_id: i64,
) -> Result<Vec<RoutingDecision>>
where
    E: SqliteExecutor<'e>,
{
    let decisions = sqlx::query_as::<_, RoutingDecision>(
        "SELECT rd.* FROM routing_decisions rd \
         JOIN (SELECT run_node_id, MAX(id) AS max_id \
               FROM routing_decisions \
               WHERE workflow_run_id = ? \
               GROUP BY run_node_id) latest \
           ON latest.max_id = rd.id",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to load latest routing decisions")?;

    Ok(decisions)
}

/// Full decision history for a node, oldest first.
pub async fn list_decisions_for_node<'e, E>(
    ex: E,
    workflow_run_id: i64,
    run_node_id: i64,
) -> Result<Vec<RoutingDecision>>
where
    E: SqliteExecutor<'e>,
{
    let decisions = sqlx::query_as::<_, RoutingDecision>(
        "SELECT * FROM routing_decisions \
         WHERE workflow_run_id = ? AND run_node_id = ? \
         ORDER BY id ASC",
    )
    .bind(workflow_run_id)
    .bind(run_node_id)
    .fetch_all(ex)
    .await
    .context("failed to list routing decisions for node")?;

    Ok(decisions)
}
