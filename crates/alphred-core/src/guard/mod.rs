//! Run and node state machines.
//!
//! Validates and executes status transitions, enforcing the allowed
//! transition graphs, optimistic locking, and timestamp management.
//! A `changes = 0` conditional update is returned as `Ok(false)` --
//! precondition failures are values the caller retries, not errors.

pub mod dispatch;

use alphred_db::models::{NodeStatus, RunStatus};
use alphred_db::queries::runs;
use chrono::Utc;
use sqlx::SqliteExecutor;
use tracing::debug;

use crate::error::EngineError;

/// The workflow-run state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending -> running
/// pending -> cancelled
/// running -> paused | completed | failed | cancelled
/// paused  -> running | cancelled
/// failed  -> running   (retry)
/// ```
///
/// Terminal statuses (`completed`, `failed`, `cancelled`) admit no
/// outgoing transitions except the `failed -> running` retry.
pub struct RunLifecycle;

impl RunLifecycle {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the run state graph.
    pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
        matches!(
            (from, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
                | (RunStatus::Paused, RunStatus::Running)
                | (RunStatus::Paused, RunStatus::Cancelled)
                | (RunStatus::Failed, RunStatus::Running)
        )
    }

    /// Attempt a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` on the first transition to `running`.
    /// - Sets `completed_at` when entering a terminal status; clears it
    ///   when a failed run is retried back to `running`.
    ///
    /// Returns `Ok(true)` when the row was updated, `Ok(false)` when the
    /// current status in the database did not match `from` (precondition
    /// failure -- the caller re-reads and retries), or an error when the
    /// transition is not in the allowed table.
    pub async fn try_transition<'e, E>(
        ex: E,
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, EngineError>
    where
        E: SqliteExecutor<'e>,
    {
        if !Self::is_valid_transition(from, to) {
            return Err(EngineError::InvalidRunTransition { run_id, from, to });
        }

        let now = Utc::now();
        let started_at = (to == RunStatus::Running).then_some(now);
        let completed_at = to.is_terminal().then_some(now);

        let rows = runs::transition_run_status(ex, run_id, from, to, started_at, completed_at)
            .await?;

        if rows == 1 {
            debug!(run_id, %from, %to, "run transition applied");
        }
        Ok(rows == 1)
    }
}

/// The run-node state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending   -> running
/// pending   -> skipped   (unreachable-branch resolution)
/// running   -> completed | failed
/// failed    -> running | pending   (retry)
/// completed -> pending   (requeue)
/// skipped   -> pending   (requeue)
/// ```
///
/// `running -> pending` is forbidden: a claimed node must reach a
/// terminal status before it can be rescheduled.
pub struct NodeLifecycle;

impl NodeLifecycle {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the node state graph.
    pub fn is_valid_transition(from: NodeStatus, to: NodeStatus) -> bool {
        matches!(
            (from, to),
            (NodeStatus::Pending, NodeStatus::Running)
                | (NodeStatus::Pending, NodeStatus::Skipped)
                | (NodeStatus::Running, NodeStatus::Completed)
                | (NodeStatus::Running, NodeStatus::Failed)
                | (NodeStatus::Failed, NodeStatus::Running)
                | (NodeStatus::Failed, NodeStatus::Pending)
                | (NodeStatus::Completed, NodeStatus::Pending)
                | (NodeStatus::Skipped, NodeStatus::Pending)
        )
    }
}
