//! Database query functions for the `run_join_barriers` table.

use anyhow::{Context, Result};
use sqlx::SqliteExecutor;

use crate::models::RunJoinBarrier;

/// Parameters for inserting a new join barrier row.
///
/// Counters start at zero and the status at `pending`. The unique
/// constraint on `spawn_source_artifact_id` makes re-emitting the same
/// spawner report a constraint violation.
#[derive(Debug, Clone)]
pub struct NewRunJoinBarrier {
    pub workflow_run_id: i64,
    pub spawner_run_node_id: i64,
    pub join_run_node_id: i64,
    pub spawn_source_artifact_id: i64,
    pub expected_children: i64,
}

/// Insert a new barrier row. Returns the inserted row.
pub async fn insert_barrier<'e, E>(ex: E, new: &NewRunJoinBarrier) -> Result<RunJoinBarrier>
where
    E: SqliteExecutor<'e>,
{
    let barrier = sqlx::query_as::<_, RunJoinBarrier>(
        "INSERT INTO run_join_barriers \
         (workflow_run_id, spawner_run_node_id, join_run_node_id, \
          spawn_source_artifact_id, expected_children) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.workflow_run_id)
    .bind(new.spawner_run_node_id)
    .bind(new.join_run_node_id)
    .bind(new.spawn_source_artifact_id)
    .bind(new.expected_children)
    .fetch_one(ex)
    .await
    .with_context(|| {
        format!(
            "failed to insert join barrier for spawner {} join {}",
            new.spawner_run_node_id, new.join_run_node_id
        )
    })?;

    Ok(barrier)
}

/// Fetch a single barrier by ID.
pub async fn get_barrier<'e, E>(ex: E, id: i64) -> Result<Option<RunJoinBarrier>>
where
    E: SqliteExecutor<'e>,
{
    let barrier =
        sqlx::query_as::<_, RunJoinBarrier>("SELECT * FROM run_join_barriers WHERE id = ?")
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch join barrier")?;

    Ok(barrier)
}

/// All barriers of a run, oldest first.
pub async fn list_barriers_for_run<'e, E>(
    ex: E,
    workflow_run_id: i64,
) -> Result<Vec<RunJoinBarrier>>
where
    E: SqliteExecutor<'e>,
{
    let barriers = sqlx::query_as::<_, RunJoinBarrier>(
        "SELECT * FROM run_join_barriers WHERE workflow_run_id = ? ORDER BY id ASC",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to list join barriers")?;

    Ok(barriers)
}

/// Barriers still accounting children (`pending` or `ready`) for a
/// (spawner, join) pair. The at-most-one invariant means this should
/// return zero or one row; callers treat more as an invariant violation.
pub async fn active_barriers_for_pair<'e, E>(
    ex: E,
    spawner_run_node_id: i64,
    join_run_node_id: i64,
) -> Result<Vec<RunJoinBarrier>>
where
    E: SqliteExecutor<'e>,
{
    let barriers = sqlx::query_as::<_, RunJoinBarrier>(
        "SELECT * FROM run_join_barriers \
         WHERE spawner_run_node_id = ? AND join_run_node_id = ? \
           AND status IN ('pending', 'ready') \
         ORDER BY id ASC",
    )
    .bind(spawner_run_node_id)
    .bind(join_run_node_id)
    .fetch_all(ex)
    .await
    .context("failed to load active barriers for pair")?;

    Ok(barriers)
}

/// The most recent barrier for a (spawner, join) pair regardless of
/// status, if any. Used by retry-reopen, which must also find `released`
/// barriers.
pub async fn latest_barrier_for_pair<'e, E>(
    ex: E,
    spawner_run_node_id: i64,
    join_run_node_id: i64,
) -> Result<Option<RunJoinBarrier>>
where
    E: SqliteExecutor<'e>,
{
    let barrier = sqlx::query_as::<_, RunJoinBarrier>(
        "SELECT * FROM run_join_barriers \
         WHERE spawner_run_node_id = ? AND join_run_node_id = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(spawner_run_node_id)
    .bind(join_run_node_id)
    .fetch_optional(ex)
    .await
    .context("failed to load latest barrier for pair")?;

    Ok(barrier)
}

/// The `ready` barrier waiting on a join node, if any.
pub async fn ready_barrier_for_join<'e, E>(
    ex: E,
    join_run_node_id: i64,
) -> Result<Option<RunJoinBarrier>>
where
    E: SqliteExecutor<'e>,
{
    let barrier = sqlx::query_as::<_, RunJoinBarrier>(
        "SELECT * FROM run_join_barriers \
         WHERE join_run_node_id = ? AND status = 'ready' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(join_run_node_id)
    .fetch_optional(ex)
    .await
    .context("failed to load ready barrier for join")?;

    Ok(barrier)
}

/// Count one child reaching a terminal status against a barrier.
///
/// Counters are advanced from the observed values with optimistic locking
/// on `terminal_children`, so two racing updates cannot both apply. The
/// status flips to `ready` exactly when the last expected child lands.
/// Returns the number of rows affected.
pub async fn record_child_terminal<'e, E>(
    ex: E,
    observed: &RunJoinBarrier,
    child_completed: bool,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let new_terminal = observed.terminal_children + 1;
    let new_completed = observed.completed_children + i64::from(child_completed);
    let new_failed = observed.failed_children + i64::from(!child_completed);
    let new_status = if new_terminal == observed.expected_children {
        "ready"
    } else {
        "pending"
    };

    let result = sqlx::query(
        "UPDATE run_join_barriers \
         SET terminal_children = ?, completed_children = ?, failed_children = ?, \
             status = ? \
         WHERE id = ? AND terminal_children = ? AND status IN ('pending', 'ready')",
    )
    .bind(new_terminal)
    .bind(new_completed)
    .bind(new_failed)
    .bind(new_status)
    .bind(observed.id)
    .bind(observed.terminal_children)
    .execute(ex)
    .await
    .context("failed to record child terminal on barrier")?;

    Ok(result.rows_affected())
}

/// Reopen a barrier after a failed child was reset to `pending`:
/// decrement the terminal and failed counters and return the status to
/// `pending`. Applies to `ready` and `released` barriers alike.
pub async fn reopen_barrier<'e, E>(ex: E, observed: &RunJoinBarrier) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_join_barriers \
         SET terminal_children = ?, failed_children = ?, status = 'pending' \
         WHERE id = ? AND terminal_children = ?",
    )
    .bind(observed.terminal_children - 1)
    .bind(observed.failed_children - 1)
    .bind(observed.id)
    .bind(observed.terminal_children)
    .execute(ex)
    .await
    .context("failed to reopen barrier")?;

    Ok(result.rows_affected())
}

/// Release a ready barrier, authorising the join to proceed.
/// Optimistically locked on the `ready` status.
pub async fn release_barrier<'e, E>(ex: E, barrier_id: i64) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE run_join_barriers SET status = 'released' \
         WHERE id = ? AND status = 'ready'",
    )
    .bind(barrier_id)
    .execute(ex)
    .await
    .context("failed to release barrier")?;

    Ok(result.rows_affected())
}
