//! Database query functions for the `phase_artifacts` table.

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sqlx::SqliteExecutor;

use crate::models::{ArtifactType, PhaseArtifact};

/// Metadata key marking a note artifact as a retry-failure summary.
pub const NOTE_KIND_RETRY_FAILURE_SUMMARY: &str = "retry_failure_summary";

/// Parameters for inserting a new phase artifact row.
#[derive(Debug, Clone)]
pub struct NewPhaseArtifact {
    pub workflow_run_id: i64,
    pub run_node_id: i64,
    pub artifact_type: ArtifactType,
    pub content_type: String,
    pub content: String,
    pub metadata: JsonValue,
}

/// Insert a new phase artifact row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_artifact<'e, E>(ex: E, new: &NewPhaseArtifact) -> Result<PhaseArtifact>
where
    E: SqliteExecutor<'e>,
{
    let artifact = sqlx::query_as::<_, PhaseArtifact>(
        "INSERT INTO phase_artifacts \
         (workflow_run_id, run_node_id, artifact_type, content_type, content, metadata) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.workflow_run_id)
    .bind(new.run_node_id)
    .bind(new.artifact_type)
    .bind(&new.content_type)
    .bind(&new.content)
    .bind(&new.metadata)
    .fetch_one(ex)
    .await
    .with_context(|| {
        format!(
            "failed to insert {} artifact for node {}",
            new.artifact_type, new.run_node_id
        )
    })?;

    Ok(artifact)
}

/// The latest artifact of *any* type per run node of a run (highest id
/// wins). Used for routing-decision staleness checks.
pub async fn latest_artifacts_for_run<'e, E>(
    ex: E,
    workflow_run_id: i64,
) -> Result<Vec<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifacts = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT pa.* FROM phase_artifacts pa \
         JOIN (SELECT run_node_id, MAX(id) AS max_id \
               FROM phase_artifacts \
               WHERE workflow_run_id = ? \
               GROUP BY run_node_id) latest \
           ON latest.max_id = pa.id",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to load latest artifacts")?;

    Ok(artifacts)
}

/// The latest `report` artifact per run node of a run.
pub async fn latest_reports_for_run<'e, E>(
    ex: E,
    workflow_run_id: i64,
) -> Result<Vec<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifacts = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT pa.* FROM phase_artifacts pa \
         JOIN (SELECT run_node_id, MAX(id) AS max_id \
               FROM phase_artifacts \
               WHERE workflow_run_id = ? AND artifact_type = 'report' \
               GROUP BY run_node_id) latest \
           ON latest.max_id = pa.id",
    )
    .bind(workflow_run_id)
    .fetch_all(ex)
    .await
    .context("failed to load latest report artifacts")?;

    Ok(artifacts)
}

/// The most recent `report` artifact for a single node, if any.
pub async fn latest_report_for_node<'e, E>(
    ex: E,
    run_node_id: i64,
) -> Result<Option<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifact = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT * FROM phase_artifacts \
         WHERE run_node_id = ? AND artifact_type = 'report' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(run_node_id)
    .fetch_optional(ex)
    .await
    .context("failed to load latest report for node")?;

    Ok(artifact)
}

/// The most recent failure `log` artifact for a single node, if any.
pub async fn latest_log_for_node<'e, E>(
    ex: E,
    run_node_id: i64,
) -> Result<Option<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifact = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT * FROM phase_artifacts \
         WHERE run_node_id = ? AND artifact_type = 'log' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(run_node_id)
    .fetch_optional(ex)
    .await
    .context("failed to load latest log for node")?;

    Ok(artifact)
}

/// The retry-failure-summary note for a node produced by a specific source
/// attempt, if any.
pub async fn retry_summary_for_attempt<'e, E>(
    ex: E,
    run_node_id: i64,
    source_attempt: i64,
) -> Result<Option<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifact = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT * FROM phase_artifacts \
         WHERE run_node_id = ? AND artifact_type = 'note' \
           AND json_extract(metadata, '$.kind') = ? \
           AND json_extract(metadata, '$.source_attempt') = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(run_node_id)
    .bind(NOTE_KIND_RETRY_FAILURE_SUMMARY)
    .bind(source_attempt)
    .fetch_optional(ex)
    .await
    .context("failed to load retry summary for attempt")?;

    Ok(artifact)
}

/// The most recent retry-failure-summary note for a node across all
/// attempts, if any.
pub async fn latest_retry_summary_for_node<'e, E>(
    ex: E,
    run_node_id: i64,
) -> Result<Option<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifact = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT * FROM phase_artifacts \
         WHERE run_node_id = ? AND artifact_type = 'note' \
           AND json_extract(metadata, '$.kind') = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(run_node_id)
    .bind(NOTE_KIND_RETRY_FAILURE_SUMMARY)
    .fetch_optional(ex)
    .await
    .context("failed to load latest retry summary for node")?;

    Ok(artifact)
}

/// All artifacts for a node, oldest first.
pub async fn list_artifacts_for_node<'e, E>(
    ex: E,
    run_node_id: i64,
) -> Result<Vec<PhaseArtifact>>
where
    E: SqliteExecutor<'e>,
{
    let artifacts = sqlx::query_as::<_, PhaseArtifact>(
        "SELECT * FROM phase_artifacts WHERE run_node_id = ? ORDER BY id ASC",
    )
    .bind(run_node_id)
    .fetch_all(ex)
    .await
    .context("failed to list artifacts for node")?;

    Ok(artifacts)
}
