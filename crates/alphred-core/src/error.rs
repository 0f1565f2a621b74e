//! Typed error taxonomy for the executor core.

use alphred_db::models::{NodeStatus, RunStatus};
use thiserror::Error;

use crate::provider::ProviderError;

/// Top-level error type for the orchestrator core.
///
/// Optimistic-concurrency precondition failures (`changes = 0`) are *not*
/// errors; they are ordinary `Ok(false)` values retried by the caller and
/// only converted to [`EngineError::ConcurrentConflict`] once the bounded
/// retry budget is exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller error: malformed selector, bad step cap, missing option.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A run-status transition outside the allowed table.
    #[error("invalid run transition: {from} -> {to} for run {run_id}")]
    InvalidRunTransition {
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    /// A node-status transition outside the allowed table.
    #[error("invalid node transition: {from} -> {to} for node {node_id}")]
    InvalidNodeTransition {
        node_id: i64,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// A run, node, or selector target does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Bounded precondition retries exhausted; the observed status kept
    /// changing under the control action.
    #[error("concurrent conflict on run {run_id}: last observed status {last_observed}")]
    ConcurrentConflict {
        run_id: i64,
        last_observed: RunStatus,
    },

    /// A spawner tried to emit a fan-out batch while a previous batch's
    /// barrier is still accounting children.
    #[error(
        "cannot emit another fan-out batch: spawner {node_key} in run \
         {workflow_run_id} already has active barrier {barrier_id}"
    )]
    DuplicateSpawnBatch {
        workflow_run_id: i64,
        node_key: String,
        barrier_id: i64,
    },

    /// More than one pending/ready barrier exists for a (spawner, join)
    /// pair. Counters are left untouched.
    #[error(
        "multiple active barriers for spawner {node_key} in run {workflow_run_id}"
    )]
    MultipleActiveBarriers {
        workflow_run_id: i64,
        node_key: String,
    },

    /// A spawner declared more subtasks than its configured cap.
    #[error(
        "spawner {node_key} declared {declared} subtasks but max_children is {max_children}"
    )]
    ChildLimitExceeded {
        node_key: String,
        declared: usize,
        max_children: i64,
    },

    /// A spawner report declared subtasks the executor cannot decode.
    #[error("malformed subtask declaration from {node_key}: {reason}")]
    MalformedSubtasks { node_key: String, reason: String },

    /// A provider failure that must be surfaced rather than absorbed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Persistence-layer failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
