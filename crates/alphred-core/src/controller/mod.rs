//! Run controller: the step loop and the cancel/pause/resume/retry
//! control actions.
//!
//! Control actions race against the executor and against each other, so
//! every one runs a bounded precondition-retry loop: read the status,
//! decide, apply the conditional update, and retry when the precondition
//! fails. Exhausting the budget surfaces a concurrent-conflict error
//! with the last observed status.

use alphred_db::models::{NodeStatus, RunNode, RunStatus};
use alphred_db::queries::{nodes, runs};
use anyhow::Context;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::executor::{self, ExecutorDeps, StepOutcome};
use crate::fanout;
use crate::guard::RunLifecycle;
use crate::limits::MAX_CONTROL_PRECONDITION_RETRIES;

/// Result of driving a run with [`execute_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    /// The first non-`executed` outcome observed (or the failure outcome
    /// after the step cap was exhausted).
    pub outcome: StepOutcome,
    /// Steps taken, including the final one.
    pub steps: u32,
}

/// Outcome of a control action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied { from: RunStatus, to: RunStatus },
    Noop { status: RunStatus },
}

/// Drive a run until a non-`executed` outcome or the step cap.
///
/// On cap exhaustion without a terminal outcome, the run is failed with
/// a diagnostic. A non-positive `max_steps` is a caller error.
pub async fn execute_run(
    pool: &SqlitePool,
    run_id: i64,
    deps: &ExecutorDeps,
    max_steps: u32,
) -> Result<RunCompletion, EngineError> {
    if max_steps == 0 {
        return Err(EngineError::InvalidRequest(
            "max_steps must be positive".to_string(),
        ));
    }

    for step in 1..=max_steps {
        let outcome = executor::execute_next_runnable_node(pool, run_id, deps).await?;
        match outcome {
            StepOutcome::Executed { .. } => continue,
            other => {
                return Ok(RunCompletion {
                    outcome: other,
                    steps: step,
                });
            }
        }
    }

    warn!(run_id, max_steps, "step cap exhausted without terminal outcome, failing run");
    let run_status = terminalize(pool, run_id, RunStatus::Failed).await?;
    Ok(RunCompletion {
        outcome: StepOutcome::RunTerminal { run_status },
        steps: max_steps,
    })
}

/// Reset nodes orphaned in `running` (e.g. by a crash mid-step) back to
/// `failed` so normal retry and terminal logic applies. Returns the
/// nodes that were reset.
pub async fn recover_orphaned_nodes(
    pool: &SqlitePool,
    run_id: i64,
) -> Result<Vec<RunNode>, EngineError> {
    let orphaned = nodes::reset_orphaned_nodes(pool, run_id).await?;
    for node in &orphaned {
        warn!(
            run_id,
            node_key = %node.node_key,
            attempt = node.attempt,
            "reset orphaned node to failed"
        );
    }
    Ok(orphaned)
}

/// Cancel a run from `pending`, `running`, or `paused`. Idempotent on an
/// already-cancelled run; other terminal statuses are invalid.
pub async fn cancel_run(pool: &SqlitePool, run_id: i64) -> Result<ControlOutcome, EngineError> {
    let mut last_observed = RunStatus::Pending;
    for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = get_run(pool, run_id).await?;
        last_observed = run.status;
        match run.status {
            RunStatus::Cancelled => {
                return Ok(ControlOutcome::Noop {
                    status: RunStatus::Cancelled,
                });
            }
            RunStatus::Completed | RunStatus::Failed => {
                return Err(EngineError::InvalidRunTransition {
                    run_id,
                    from: run.status,
                    to: RunStatus::Cancelled,
                });
            }
            from @ (RunStatus::Pending | RunStatus::Running | RunStatus::Paused) => {
                if RunLifecycle::try_transition(pool, run_id, from, RunStatus::Cancelled).await? {
                    info!(run_id, %from, "run cancelled");
                    return Ok(ControlOutcome::Applied {
                        from,
                        to: RunStatus::Cancelled,
                    });
                }
            }
        }
    }
    Err(EngineError::ConcurrentConflict {
        run_id,
        last_observed,
    })
}

/// Pause a running run. Idempotent on an already-paused run. A node
/// currently executing runs to completion; only new claims are refused.
pub async fn pause_run(pool: &SqlitePool, run_id: i64) -> Result<ControlOutcome, EngineError> {
    let mut last_observed = RunStatus::Pending;
    for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = get_run(pool, run_id).await?;
        last_observed = run.status;
        match run.status {
            RunStatus::Paused => {
                return Ok(ControlOutcome::Noop {
                    status: RunStatus::Paused,
                });
            }
            RunStatus::Running => {
                if RunLifecycle::try_transition(
                    pool,
                    run_id,
                    RunStatus::Running,
                    RunStatus::Paused,
                )
                .await?
                {
                    info!(run_id, "run paused");
                    return Ok(ControlOutcome::Applied {
                        from: RunStatus::Running,
                        to: RunStatus::Paused,
                    });
                }
            }
            from => {
                return Err(EngineError::InvalidRunTransition {
                    run_id,
                    from,
                    to: RunStatus::Paused,
                });
            }
        }
    }
    Err(EngineError::ConcurrentConflict {
        run_id,
        last_observed,
    })
}

/// Resume a paused run. Idempotent on an already-running run.
pub async fn resume_run(pool: &SqlitePool, run_id: i64) -> Result<ControlOutcome, EngineError> {
    let mut last_observed = RunStatus::Pending;
    for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = get_run(pool, run_id).await?;
        last_observed = run.status;
        match run.status {
            RunStatus::Running => {
                return Ok(ControlOutcome::Noop {
                    status: RunStatus::Running,
                });
            }
            RunStatus::Paused => {
                if RunLifecycle::try_transition(
                    pool,
                    run_id,
                    RunStatus::Paused,
                    RunStatus::Running,
                )
                .await?
                {
                    info!(run_id, "run resumed");
                    return Ok(ControlOutcome::Applied {
                        from: RunStatus::Paused,
                        to: RunStatus::Running,
                    });
                }
            }
            from => {
                return Err(EngineError::InvalidRunTransition {
                    run_id,
                    from,
                    to: RunStatus::Running,
                });
            }
        }
    }
    Err(EngineError::ConcurrentConflict {
        run_id,
        last_observed,
    })
}

/// Retry a failed run: within one transaction, reset every latest-attempt
/// `failed` node to `pending` (incrementing its attempt and reopening any
/// fan-out barrier it was counted against), then flip the run back to
/// `running`. Fails when no failed nodes exist.
pub async fn retry_run(pool: &SqlitePool, run_id: i64) -> Result<ControlOutcome, EngineError> {
    let mut last_observed = RunStatus::Pending;
    'attempts: for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = get_run(pool, run_id).await?;
        last_observed = run.status;
        if run.status != RunStatus::Failed {
            return Err(EngineError::InvalidRunTransition {
                run_id,
                from: run.status,
                to: RunStatus::Running,
            });
        }

        let mut tx = pool.begin().await.context("begin retry transaction")?;
        let all_nodes = nodes::list_nodes_for_run(&mut *tx, run_id).await?;
        let failed: Vec<&RunNode> = all_nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .collect();
        if failed.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "run {run_id} has no failed nodes to retry"
            )));
        }

        for node in &failed {
            let rows = nodes::retry_node_to_pending(&mut *tx, node.id, node.attempt).await?;
            if rows != 1 {
                // Someone got to this node first; rescan from scratch.
                drop(tx);
                continue 'attempts;
            }
            if node.spawner_node_id.is_some() && node.join_node_id.is_some() {
                fanout::reopen_for_child(&mut *tx, node).await?;
            }
        }

        if !RunLifecycle::try_transition(&mut *tx, run_id, RunStatus::Failed, RunStatus::Running)
            .await?
        {
            drop(tx);
            continue 'attempts;
        }
        tx.commit().await.context("commit retry transaction")?;
        info!(run_id, retried = failed.len(), "failed nodes reset, run retried");
        return Ok(ControlOutcome::Applied {
            from: RunStatus::Failed,
            to: RunStatus::Running,
        });
    }
    Err(EngineError::ConcurrentConflict {
        run_id,
        last_observed,
    })
}

async fn get_run(pool: &SqlitePool, run_id: i64) -> Result<alphred_db::models::WorkflowRun, EngineError> {
    runs::get_run(pool, run_id)
        .await?
        .ok_or_else(|| EngineError::NotFound {
            entity: "workflow run",
            id: run_id.to_string(),
        })
}

/// Transition a run to a terminal status with a precondition-retry loop.
async fn terminalize(
    pool: &SqlitePool,
    run_id: i64,
    to: RunStatus,
) -> Result<RunStatus, EngineError> {
    let mut last_observed = RunStatus::Running;
    for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = get_run(pool, run_id).await?;
        last_observed = run.status;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        if !RunLifecycle::is_valid_transition(run.status, to) {
            return Err(EngineError::InvalidRunTransition {
                run_id,
                from: run.status,
                to,
            });
        }
        if RunLifecycle::try_transition(pool, run_id, run.status, to).await? {
            return Ok(to);
        }
    }
    Err(EngineError::ConcurrentConflict {
        run_id,
        last_observed,
    })
}
