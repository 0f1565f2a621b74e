//! Database query functions for the `workflow_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::models::{RunStatus, WorkflowRun};

/// Insert a new workflow run in `pending` status. Returns the inserted row
/// with server-generated defaults (id, status, created_at).
pub async fn insert_run<'e, E>(ex: E, workflow_tree_id: i64) -> Result<WorkflowRun>
where
    E: SqliteExecutor<'e>,
{
    let run = sqlx::query_as::<_, WorkflowRun>(
        "INSERT INTO workflow_runs (workflow_tree_id) VALUES (?) RETURNING *",
    )
    .bind(workflow_tree_id)
    .fetch_one(ex)
    .await
    .context("failed to insert workflow run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run<'e, E>(ex: E, id: i64) -> Result<Option<WorkflowRun>>
where
    E: SqliteExecutor<'e>,
{
    let run = sqlx::query_as::<_, WorkflowRun>("SELECT * FROM workflow_runs WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch workflow run")?;

    Ok(run)
}

/// Atomically transition a run from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = ?from`, so the row is only updated if the current status
/// matches. Returns the number of rows affected (0 means the status did
/// not match, or the run does not exist).
///
/// `started_at` is merged with COALESCE (first start wins); `completed_at`
/// is written verbatim, so passing `None` clears it (retried runs become
/// live again).
pub async fn transition_run_status<'e, E>(
    ex: E,
    run_id: i64,
    from: RunStatus,
    to: RunStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE workflow_runs \
         SET status = ?, \
             started_at = COALESCE(?, started_at), \
             completed_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(run_id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to transition run status")?;

    Ok(result.rows_affected())
}

/// Delete a run. Child rows (nodes, edges, artifacts, decisions, barriers)
/// are removed by cascade.
pub async fn delete_run<'e, E>(ex: E, run_id: i64) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM workflow_runs WHERE id = ?")
        .bind(run_id)
        .execute(ex)
        .await
        .context("failed to delete workflow run")?;

    Ok(result.rows_affected())
}
