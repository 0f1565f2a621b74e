//! Semantic wrappers around the node state machine's guarded writes.
//!
//! Each function validates the transition against
//! [`super::NodeLifecycle`], applies the conditional update, and returns
//! whether the precondition held.

use alphred_db::models::{NodeStatus, RunNode};
use alphred_db::queries::nodes;
use chrono::Utc;
use sqlx::SqliteExecutor;

use super::NodeLifecycle;
use crate::error::EngineError;

/// Claim a node for execution: `pending -> running`.
///
/// Sets `started_at`, clears `completed_at`. Returns `Ok(false)` when the
/// node is no longer pending (lost claim race).
pub async fn claim_node<'e, E>(ex: E, node_id: i64) -> Result<bool, EngineError>
where
    E: SqliteExecutor<'e>,
{
    let rows = nodes::claim_node(ex, node_id, Utc::now()).await?;
    Ok(rows == 1)
}

/// Complete a running node: `running -> completed`.
pub async fn complete_node<'e, E>(ex: E, node_id: i64) -> Result<bool, EngineError>
where
    E: SqliteExecutor<'e>,
{
    let rows = nodes::finish_node(ex, node_id, NodeStatus::Completed, Utc::now()).await?;
    Ok(rows == 1)
}

/// Fail a running node: `running -> failed`.
pub async fn fail_node<'e, E>(ex: E, node_id: i64) -> Result<bool, EngineError>
where
    E: SqliteExecutor<'e>,
{
    let rows = nodes::finish_node(ex, node_id, NodeStatus::Failed, Utc::now()).await?;
    Ok(rows == 1)
}

/// Retry a failed node: `failed -> pending`, incrementing the attempt
/// counter and clearing both timestamps. Optimistically locked on the
/// node's observed attempt.
pub async fn retry_node<'e, E>(ex: E, node: &RunNode) -> Result<bool, EngineError>
where
    E: SqliteExecutor<'e>,
{
    if node.status != NodeStatus::Failed {
        return Err(EngineError::InvalidNodeTransition {
            node_id: node.id,
            from: node.status,
            to: NodeStatus::Pending,
        });
    }
    let rows = nodes::retry_node_to_pending(ex, node.id, node.attempt).await?;
    Ok(rows == 1)
}

/// Requeue a terminal node back to `pending` without a new attempt
/// (used when a released join must run again).
pub async fn requeue_node<'e, E>(ex: E, node: &RunNode) -> Result<bool, EngineError>
where
    E: SqliteExecutor<'e>,
{
    if !NodeLifecycle::is_valid_transition(node.status, NodeStatus::Pending) {
        return Err(EngineError::InvalidNodeTransition {
            node_id: node.id,
            from: node.status,
            to: NodeStatus::Pending,
        });
    }
    let rows = nodes::requeue_node_to_pending(ex, node.id, node.status).await?;
    Ok(rows == 1)
}

/// Mark an unreachable pending node as skipped: `pending -> skipped`.
pub async fn skip_node<'e, E>(ex: E, node_id: i64) -> Result<bool, EngineError>
where
    E: SqliteExecutor<'e>,
{
    let rows = nodes::skip_node(ex, node_id, Utc::now()).await?;
    Ok(rows == 1)
}
