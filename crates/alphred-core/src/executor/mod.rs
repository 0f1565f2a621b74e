//! The node executor: claim -> assemble context -> invoke provider ->
//! route -> persist.
//!
//! One step advances one node of one run. Context is assembled and
//! persisted before the provider call, the provider runs outside any
//! open transaction, and the outcome is persisted in a second
//! transaction together with the status flip and barrier accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alphred_db::models::{
    ArtifactType, EdgeKind, NodeRole, NodeStatus, NodeType, PhaseArtifact, RouteOn,
    RoutingDecision, RunEdge, RunJoinBarrier, RunNode, RunStatus, WorkflowRun,
};
use alphred_db::queries::artifacts::{
    self, NewPhaseArtifact, NOTE_KIND_RETRY_FAILURE_SUMMARY,
};
use alphred_db::queries::decisions::{self, NewRoutingDecision};
use alphred_db::queries::{barriers, edges, nodes, runs};
use anyhow::Context;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::context::truncate::truncate_head_tail;
use crate::context::{
    assemble, AssembledContext, ContextRequest, FailureRouteInput, UpstreamInput,
};
use crate::error::EngineError;
use crate::fanout;
use crate::guard::{dispatch, RunLifecycle};
use crate::limits::{MAX_CONTROL_PRECONDITION_RETRIES, MAX_ERROR_SUMMARY_CHARS};
use crate::provider::{
    drive_provider, EventObserver, FailureKind, ProviderError, ProviderOutcome,
    ProviderRegistry, ProviderRunOptions,
};
use crate::routing::RouteMap;
use crate::selector::{self, Selection, TerminalResolution};
use crate::workspace::{WorkspaceProvider, WorktreeRequest};

/// Process-wide collaborators the executor needs for a step.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub providers: Arc<ProviderRegistry>,
    pub workspace: Arc<dyn WorkspaceProvider>,
    /// Repository name forwarded to the workspace layer.
    pub repo_name: String,
    /// Synchronous per-event callback, invoked in emission order.
    pub observer: Option<Arc<EventObserver>>,
    /// Wall-clock limit per provider invocation.
    pub provider_timeout: Option<Duration>,
}

/// Outcome of one executor step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A node was claimed and driven to an outcome (or rescheduled).
    Executed {
        node_status: NodeStatus,
        run_status: RunStatus,
    },
    /// The run is paused (or owned by an in-flight step elsewhere); no
    /// claim was made.
    Blocked { run_status: RunStatus },
    /// The run is in (or just reached) a terminal status.
    RunTerminal { run_status: RunStatus },
}

/// Which node a single-node execution targets.
#[derive(Debug, Clone)]
pub enum NodeTarget {
    NextRunnable,
    ByKey(String),
}

#[derive(Debug, Clone)]
struct StepMode {
    allow_retries: bool,
    /// Single-node mode: after the node reaches a terminal status, the
    /// run is finalised regardless of remaining pending nodes.
    finalize_run: bool,
    target: NodeTarget,
}

/// Everything loaded for one scan of the run graph.
struct GraphSnapshot {
    nodes: Vec<RunNode>,
    edges: Vec<RunEdge>,
    latest_decisions: HashMap<i64, RoutingDecision>,
    latest_artifacts: HashMap<i64, PhaseArtifact>,
    latest_reports: HashMap<i64, PhaseArtifact>,
    barriers: Vec<RunJoinBarrier>,
}

async fn load_graph(pool: &SqlitePool, run_id: i64) -> Result<GraphSnapshot, EngineError> {
    let node_rows = nodes::list_nodes_for_run(pool, run_id).await?;
    let edge_rows = edges::list_edges_for_run(pool, run_id).await?;
    let latest_decisions = decisions::latest_decisions_for_run(pool, run_id)
        .await?
        .into_iter()
        .map(|d| (d.run_node_id, d))
        .collect();
    let latest_artifacts = artifacts::latest_artifacts_for_run(pool, run_id)
        .await?
        .into_iter()
        .map(|a| (a.run_node_id, a))
        .collect();
    let latest_reports = artifacts::latest_reports_for_run(pool, run_id)
        .await?
        .into_iter()
        .map(|a| (a.run_node_id, a))
        .collect();
    let barrier_rows = barriers::list_barriers_for_run(pool, run_id).await?;

    Ok(GraphSnapshot {
        nodes: node_rows,
        edges: edge_rows,
        latest_decisions,
        latest_artifacts,
        latest_reports,
        barriers: barrier_rows,
    })
}

/// Execute the next runnable node of a run, or resolve the run's terminal
/// outcome when nothing is runnable.
pub async fn execute_next_runnable_node(
    pool: &SqlitePool,
    run_id: i64,
    deps: &ExecutorDeps,
) -> Result<StepOutcome, EngineError> {
    step(
        pool,
        run_id,
        deps,
        &StepMode {
            allow_retries: true,
            finalize_run: false,
            target: NodeTarget::NextRunnable,
        },
    )
    .await
}

/// Execute exactly one node (by key or next runnable) with retries
/// disabled; the run is finalised from the node's terminal status.
pub async fn execute_single_node(
    pool: &SqlitePool,
    run_id: i64,
    target: NodeTarget,
    deps: &ExecutorDeps,
) -> Result<StepOutcome, EngineError> {
    step(
        pool,
        run_id,
        deps,
        &StepMode {
            allow_retries: false,
            finalize_run: true,
            target,
        },
    )
    .await
}

async fn step(
    pool: &SqlitePool,
    run_id: i64,
    deps: &ExecutorDeps,
    mode: &StepMode,
) -> Result<StepOutcome, EngineError> {
    let mut last_observed = RunStatus::Pending;

    for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = runs::get_run(pool, run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "workflow run",
                id: run_id.to_string(),
            })?;
        last_observed = run.status;

        if run.status.is_terminal() {
            return Ok(StepOutcome::RunTerminal {
                run_status: run.status,
            });
        }
        if run.status == RunStatus::Paused {
            return Ok(StepOutcome::Blocked {
                run_status: run.status,
            });
        }
        if run.status == RunStatus::Pending {
            // A lost race just means another worker started the run.
            let _ = RunLifecycle::try_transition(pool, run_id, RunStatus::Pending, RunStatus::Running)
                .await?;
        }

        let graph = load_graph(pool, run_id).await?;
        let routes = RouteMap::build(
            &graph.nodes,
            &graph.edges,
            &graph.latest_decisions,
            &graph.latest_artifacts,
        );
        let selection = selector::select_next_runnable(&graph.nodes, &routes, &graph.barriers);

        let target = match &mode.target {
            NodeTarget::NextRunnable => selection.next_runnable.clone(),
            NodeTarget::ByKey(key) => {
                let node = graph
                    .nodes
                    .iter()
                    .find(|n| n.node_key == *key)
                    .ok_or_else(|| EngineError::NotFound {
                        entity: "run node",
                        id: key.clone(),
                    })?;
                if !selector::is_runnable(node, &routes, &graph.barriers) {
                    return Err(EngineError::InvalidRequest(format!(
                        "node {key:?} is not runnable (status {})",
                        node.status
                    )));
                }
                Some(node.clone())
            }
        };

        let Some(node) = target else {
            // Loop routes: a freshly-completed source may select an edge
            // pointing at a node that already completed (e.g. a reviewer
            // requesting changes on an earlier phase). Requeue such
            // targets for a new attempt and rescan before resolving.
            if matches!(mode.target, NodeTarget::NextRunnable) {
                let requeued = requeue_loop_targets(pool, &routes).await?;
                if requeued > 0 {
                    continue;
                }
            }
            return resolve_nothing_runnable(pool, run_id, &graph, &selection).await;
        };

        // Claim transaction: the run must still be running, the node must
        // still be pending, and a join's ready barrier is released
        // atomically with the claim.
        let mut tx = pool.begin().await.context("begin claim transaction")?;
        let run_now = runs::get_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "workflow run",
                id: run_id.to_string(),
            })?;
        if run_now.status.is_terminal() {
            return Ok(StepOutcome::RunTerminal {
                run_status: run_now.status,
            });
        }
        if run_now.status == RunStatus::Paused {
            return Ok(StepOutcome::Blocked {
                run_status: run_now.status,
            });
        }
        if run_now.status != RunStatus::Running {
            continue;
        }
        if !dispatch::claim_node(&mut *tx, node.id).await? {
            // Lost the claim race; rescan.
            continue;
        }
        if node.node_role == NodeRole::Join {
            if let Some(barrier) = barriers::ready_barrier_for_join(&mut *tx, node.id).await? {
                barriers::release_barrier(&mut *tx, barrier.id).await?;
                info!(barrier_id = barrier.id, join = %node.node_key, "barrier released");
            }
        }
        tx.commit().await.context("commit claim transaction")?;

        let node = nodes::get_node(pool, node.id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "run node",
                id: node.id.to_string(),
            })?;
        info!(
            run_id,
            node_id = node.id,
            node_key = %node.node_key,
            attempt = node.attempt,
            "claimed node"
        );

        return execute_claimed_node(pool, &run, &node, &graph, &routes, deps, mode).await;
    }

    Err(EngineError::ConcurrentConflict {
        run_id,
        last_observed,
    })
}

/// Requeue completed nodes that a newer selected route points back at.
///
/// A target qualifies when its selecting source finished *after* it (or
/// is the node itself, for self-retry edges). The requeue is a
/// `completed|skipped -> pending` transition with a fresh attempt.
async fn requeue_loop_targets(
    pool: &SqlitePool,
    routes: &RouteMap,
) -> Result<usize, EngineError> {
    let mut requeued = 0;
    for (source_id, edge) in &routes.selected_edge_by_source {
        let Some(source) = routes.node(*source_id) else {
            continue;
        };
        let Some(target) = routes.node(edge.target_run_node_id) else {
            continue;
        };
        if !matches!(target.status, NodeStatus::Completed | NodeStatus::Skipped) {
            continue;
        }
        let source_is_newer = match (source.completed_at, target.completed_at) {
            (Some(s), Some(t)) => s > t,
            _ => false,
        };
        if source_is_newer || source.id == target.id {
            let rows =
                nodes::requeue_node_for_new_attempt(pool, target.id, target.attempt).await?;
            if rows == 1 {
                requeued += 1;
                info!(
                    node_key = %target.node_key,
                    next_attempt = target.attempt + 1,
                    "requeued loop target for new attempt"
                );
            }
        }
    }
    Ok(requeued)
}

/// Resolve the run's terminal outcome when nothing is runnable.
async fn resolve_nothing_runnable(
    pool: &SqlitePool,
    run_id: i64,
    graph: &GraphSnapshot,
    selection: &Selection,
) -> Result<StepOutcome, EngineError> {
    match selector::resolve_terminal(&graph.nodes, selection) {
        None => {
            // A node is mid-flight under another worker.
            Ok(StepOutcome::Blocked {
                run_status: RunStatus::Running,
            })
        }
        Some(TerminalResolution::Failed) => {
            if selection.has_no_route {
                warn!(run_id, "run failed: a completed node's decision matched no route");
            }
            if selection.has_unresolved_decision {
                warn!(run_id, "run failed: a completed node has no applicable routing decision");
            }
            let status = finalize_run(pool, run_id, RunStatus::Failed).await?;
            Ok(StepOutcome::RunTerminal { run_status: status })
        }
        Some(TerminalResolution::Completed) => {
            for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
                let mut tx = pool.begin().await.context("begin completion transaction")?;
                for node in &graph.nodes {
                    if node.status == NodeStatus::Pending {
                        dispatch::skip_node(&mut *tx, node.id).await?;
                    }
                }
                if RunLifecycle::try_transition(
                    &mut *tx,
                    run_id,
                    RunStatus::Running,
                    RunStatus::Completed,
                )
                .await?
                {
                    tx.commit().await.context("commit completion transaction")?;
                    info!(run_id, "run completed");
                    return Ok(StepOutcome::RunTerminal {
                        run_status: RunStatus::Completed,
                    });
                }
                drop(tx);
                let run = runs::get_run(pool, run_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound {
                        entity: "workflow run",
                        id: run_id.to_string(),
                    })?;
                if run.status.is_terminal() {
                    return Ok(StepOutcome::RunTerminal {
                        run_status: run.status,
                    });
                }
                if run.status == RunStatus::Paused {
                    return Ok(StepOutcome::Blocked {
                        run_status: run.status,
                    });
                }
            }
            let run = runs::get_run(pool, run_id).await?;
            Err(EngineError::ConcurrentConflict {
                run_id,
                last_observed: run.map(|r| r.status).unwrap_or(RunStatus::Running),
            })
        }
    }
}

/// Transition a run to a terminal status, retrying precondition failures.
async fn finalize_run(
    pool: &SqlitePool,
    run_id: i64,
    to: RunStatus,
) -> Result<RunStatus, EngineError> {
    let mut last_observed = RunStatus::Running;
    for _ in 0..MAX_CONTROL_PRECONDITION_RETRIES {
        let run = runs::get_run(pool, run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "workflow run",
                id: run_id.to_string(),
            })?;
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

/// Context gathered for a claimed node, plus routing diagnostics.
struct GatheredContext {
    assembled: AssembledContext,
    reached_via_failure_route: bool,
}

async fn gather_context(
    pool: &SqlitePool,
    node: &RunNode,
    graph: &GraphSnapshot,
    routes: &RouteMap,
) -> Result<GatheredContext, EngineError> {
    let empty = Vec::new();
    let incoming = routes.incoming_by_target.get(&node.id).unwrap_or(&empty);

    // Direct predecessors: completed sources of incoming success edges
    // whose selected route points here (dynamic spawner-to-child edges
    // are always live).
    let mut predecessors: Vec<&RunNode> = Vec::new();
    for edge in incoming.iter().filter(|e| e.route_on == RouteOn::Success) {
        let Some(source) = routes.node(edge.source_run_node_id) else {
            continue;
        };
        if source.status != NodeStatus::Completed {
            continue;
        }
        let qualifies = edge.edge_kind == EdgeKind::DynamicSpawnerToChild
            || routes
                .selected_edge(source.id)
                .is_some_and(|selected| selected.id == edge.id);
        if qualifies {
            predecessors.push(source);
        }
    }
    predecessors.sort_by(|a, b| {
        a.sequence_path
            .cmp(&b.sequence_path)
            .then(a.sequence_index.cmp(&b.sequence_index))
            .then(a.node_key.cmp(&b.node_key))
            .then(a.id.cmp(&b.id))
    });
    predecessors.dedup_by_key(|n| n.id);

    let upstream: Vec<UpstreamInput<'_>> = predecessors
        .iter()
        .map(|source| UpstreamInput {
            source,
            report: graph.latest_reports.get(&source.id),
            has_other_artifacts: graph.latest_artifacts.contains_key(&source.id)
                && !graph.latest_reports.contains_key(&source.id),
        })
        .collect();

    // Retry summary from the directly preceding attempt.
    let retry_note = if node.attempt > 1 {
        artifacts::retry_summary_for_attempt(pool, node.id, node.attempt - 1).await?
    } else {
        None
    };

    // Failure-route diagnostics when a failure edge selected this node.
    let failure_source = incoming
        .iter()
        .filter(|e| e.route_on == RouteOn::Failure)
        .find(|e| routes.edge_route_runnable(e))
        .and_then(|e| routes.node(e.source_run_node_id));
    let failure_data = match failure_source {
        Some(source) => {
            let log = artifacts::latest_log_for_node(pool, source.id).await?;
            let summary = artifacts::latest_retry_summary_for_node(pool, source.id).await?;
            let reason = log
                .as_ref()
                .and_then(|l| l.metadata.get("classification"))
                .and_then(|v| v.as_str())
                .unwrap_or("failure")
                .to_string();
            Some((source, log, summary, reason))
        }
        None => None,
    };

    let request = ContextRequest {
        target: node,
        upstream,
        retry_summary: retry_note.as_ref(),
        failure_route: failure_data
            .as_ref()
            .map(|(source, log, summary, reason)| FailureRouteInput {
                source,
                failure_log: log.as_ref(),
                retry_summary: summary.as_ref(),
                failure_reason: reason.clone(),
            }),
    };
    let assembled = assemble(&request);

    Ok(GatheredContext {
        assembled,
        reached_via_failure_route: failure_data.is_some(),
    })
}

async fn execute_claimed_node(
    pool: &SqlitePool,
    run: &WorkflowRun,
    node: &RunNode,
    graph: &GraphSnapshot,
    routes: &RouteMap,
    deps: &ExecutorDeps,
    mode: &StepMode,
) -> Result<StepOutcome, EngineError> {
    let gathered = gather_context(pool, node, graph, routes).await?;
    let manifest_value =
        serde_json::to_value(&gathered.assembled.manifest).context("serialize context manifest")?;
    nodes::set_execution_metadata(pool, node.id, &manifest_value).await?;

    // Human and tool nodes are no-op completions with an empty report.
    if node.node_type != NodeType::Agent {
        let mut tx = pool.begin().await.context("begin result transaction")?;
        artifacts::insert_artifact(
            &mut *tx,
            &NewPhaseArtifact {
                workflow_run_id: node.workflow_run_id,
                run_node_id: node.id,
                artifact_type: ArtifactType::Report,
                content_type: node.prompt_content_type.clone(),
                content: String::new(),
                metadata: json!({ "manifest": manifest_value, "tokens_used": 0 }),
            },
        )
        .await?;
        dispatch::complete_node(&mut *tx, node.id).await?;
        if node.spawner_node_id.is_some() && node.join_node_id.is_some() {
            fanout::record_child_terminal(&mut *tx, node, true).await?;
        }
        tx.commit().await.context("commit result transaction")?;
        return finish_step(pool, run.id, node.id, mode).await;
    }

    match invoke_provider(run, node, &gathered.assembled, deps).await {
        Ok(outcome) => {
            persist_success(pool, node, routes, &manifest_value, &outcome).await?;
            apply_spawn_if_declared(pool, node, graph, &outcome).await?;
        }
        Err(err) => {
            persist_failure(
                pool,
                node,
                &err,
                mode.allow_retries,
                gathered.reached_via_failure_route,
            )
            .await?;
        }
    }

    finish_step(pool, run.id, node.id, mode).await
}

async fn invoke_provider(
    run: &WorkflowRun,
    node: &RunNode,
    assembled: &AssembledContext,
    deps: &ExecutorDeps,
) -> Result<ProviderOutcome, ProviderError> {
    let provider_name = node.provider.as_deref().ok_or_else(|| {
        ProviderError::new(
            FailureKind::InvalidConfig,
            format!("node {} has no provider configured", node.node_key),
        )
    })?;
    let provider = deps.providers.resolve(provider_name)?;

    let worktree = deps
        .workspace
        .create_run_worktree(&WorktreeRequest {
            repo_name: deps.repo_name.clone(),
            tree_key: run.workflow_tree_id.to_string(),
            run_id: run.id,
            node_key: node.node_key.clone(),
        })
        .await
        .map_err(|e| {
            ProviderError::new(
                FailureKind::InternalError,
                format!("workspace provisioning failed: {e:#}"),
            )
        })?;

    let mut options = ProviderRunOptions::new(worktree.worktree_path);
    options.timeout = deps.provider_timeout;
    options.context = assembled.rendered();

    drive_provider(
        provider,
        &node.prompt,
        options,
        deps.observer.as_deref(),
        None,
    )
    .await
}

async fn persist_success(
    pool: &SqlitePool,
    node: &RunNode,
    routes: &RouteMap,
    manifest_value: &serde_json::Value,
    outcome: &ProviderOutcome,
) -> Result<(), EngineError> {
    let events_value = serde_json::to_value(&outcome.events).context("serialize provider events")?;
    let mut metadata = json!({
        "manifest": manifest_value,
        "tokens_used": outcome.tokens_used,
        "provider_events": events_value,
    });
    if let Some(decision) = outcome.routing_decision {
        metadata["routing_decision"] = json!(decision);
    }

    let mut tx = pool.begin().await.context("begin result transaction")?;

    artifacts::insert_artifact(
        &mut *tx,
        &NewPhaseArtifact {
            workflow_run_id: node.workflow_run_id,
            run_node_id: node.id,
            artifact_type: ArtifactType::Report,
            content_type: node.prompt_content_type.clone(),
            content: outcome.content.clone(),
            metadata,
        },
    )
    .await?;

    if let Some(decision) = outcome.routing_decision {
        decisions::insert_decision(
            &mut *tx,
            &NewRoutingDecision {
                workflow_run_id: node.workflow_run_id,
                run_node_id: node.id,
                decision_type: decision,
                attempt: node.attempt,
                raw_output: json!({
                    "source": "provider_result",
                    "attempt": node.attempt,
                    "decision": decision,
                }),
            },
        )
        .await?;

        // No edge accepts this decision: synthesise the terminal
        // no_route decision alongside it.
        if routes.has_success_candidates(node.id)
            && routes.evaluate_success_route(node.id, Some(decision)).is_none()
        {
            decisions::insert_decision(
                &mut *tx,
                &NewRoutingDecision {
                    workflow_run_id: node.workflow_run_id,
                    run_node_id: node.id,
                    decision_type: alphred_db::models::DecisionType::NoRoute,
                    attempt: node.attempt,
                    raw_output: json!({
                        "source": "router",
                        "attempt": node.attempt,
                        "declared": decision,
                    }),
                },
            )
            .await?;
            warn!(
                node_key = %node.node_key,
                declared = %decision,
                "decision matched no outgoing edge, no_route persisted"
            );
        }
    }

    dispatch::complete_node(&mut *tx, node.id).await?;
    if node.spawner_node_id.is_some() && node.join_node_id.is_some() {
        fanout::record_child_terminal(&mut *tx, node, true).await?;
    }

    tx.commit().await.context("commit result transaction")?;
    info!(
        node_key = %node.node_key,
        attempt = node.attempt,
        tokens = outcome.tokens_used,
        "node completed"
    );
    Ok(())
}

/// Apply fan-out when a spawner's report declares subtasks. Runs in its
/// own transaction after the result commit, so a rejected batch retains
/// the spawner's result.
async fn apply_spawn_if_declared(
    pool: &SqlitePool,
    node: &RunNode,
    graph: &GraphSnapshot,
    outcome: &ProviderOutcome,
) -> Result<(), EngineError> {
    if node.node_role != NodeRole::Spawner {
        return Ok(());
    }
    let subtasks =
        fanout::parse_subtasks(&outcome.content).map_err(|reason| EngineError::MalformedSubtasks {
            node_key: node.node_key.clone(),
            reason,
        })?;
    if subtasks.is_empty() {
        return Ok(());
    }

    let join = graph
        .edges
        .iter()
        .filter(|e| {
            e.source_run_node_id == node.id
                && e.route_on == RouteOn::Success
                && e.edge_kind == EdgeKind::Tree
        })
        .filter_map(|e| graph.nodes.iter().find(|n| n.id == e.target_run_node_id))
        .find(|n| n.node_role == NodeRole::Join)
        .ok_or_else(|| {
            EngineError::Storage(anyhow::anyhow!(
                "spawner {} has no join reachable via static success edges",
                node.node_key
            ))
        })?;

    let report = artifacts::latest_report_for_node(pool, node.id)
        .await?
        .ok_or_else(|| {
            EngineError::Storage(anyhow::anyhow!(
                "spawner {} completed without a report artifact",
                node.node_key
            ))
        })?;

    fanout::apply_spawn(pool, node, join, &report, &subtasks).await?;
    Ok(())
}

async fn persist_failure(
    pool: &SqlitePool,
    node: &RunNode,
    err: &ProviderError,
    allow_retries: bool,
    reached_via_failure_route: bool,
) -> Result<(), EngineError> {
    let retry_eligible = allow_retries && err.retryable() && node.attempt <= node.max_retries;

    let mut tx = pool.begin().await.context("begin failure transaction")?;
    dispatch::fail_node(&mut *tx, node.id).await?;

    if retry_eligible {
        let summary = truncate_head_tail(
            &format!("attempt {} failed: {err}", node.attempt),
            MAX_ERROR_SUMMARY_CHARS,
        );
        artifacts::insert_artifact(
            &mut *tx,
            &NewPhaseArtifact {
                workflow_run_id: node.workflow_run_id,
                run_node_id: node.id,
                artifact_type: ArtifactType::Note,
                content_type: "text/plain".to_string(),
                content: summary.text,
                metadata: json!({
                    "kind": NOTE_KIND_RETRY_FAILURE_SUMMARY,
                    "source_attempt": node.attempt,
                    "classification": err.kind,
                    "retryable": true,
                    "status_code": err.status_code,
                    "failure_code": err.failure_code,
                }),
            },
        )
        .await?;
        let node_failed = RunNode {
            status: NodeStatus::Failed,
            ..node.clone()
        };
        dispatch::retry_node(&mut *tx, &node_failed).await?;
        info!(
            node_key = %node.node_key,
            attempt = node.attempt,
            classification = %err.kind,
            "retryable failure absorbed, node rescheduled"
        );
    } else {
        artifacts::insert_artifact(
            &mut *tx,
            &NewPhaseArtifact {
                workflow_run_id: node.workflow_run_id,
                run_node_id: node.id,
                artifact_type: ArtifactType::Log,
                content_type: "text/plain".to_string(),
                content: err.to_string(),
                metadata: json!({
                    "classification": err.kind,
                    "retryable": err.retryable(),
                    "status_code": err.status_code,
                    "failure_code": err.failure_code,
                    "failure_route": reached_via_failure_route,
                }),
            },
        )
        .await?;
        if node.spawner_node_id.is_some() && node.join_node_id.is_some() {
            fanout::record_child_terminal(&mut *tx, node, false).await?;
        }
        warn!(
            node_key = %node.node_key,
            attempt = node.attempt,
            classification = %err.kind,
            "node failed"
        );
    }

    tx.commit().await.context("commit failure transaction")?;
    Ok(())
}

/// Re-observe node and run after persisting an outcome, finalising the
/// run in single-node mode.
async fn finish_step(
    pool: &SqlitePool,
    run_id: i64,
    node_id: i64,
    mode: &StepMode,
) -> Result<StepOutcome, EngineError> {
    let node = nodes::get_node(pool, node_id)
        .await?
        .ok_or_else(|| EngineError::NotFound {
            entity: "run node",
            id: node_id.to_string(),
        })?;

    if mode.finalize_run && node.status.is_terminal() {
        let to = if node.status == NodeStatus::Completed {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let run_status = finalize_run(pool, run_id, to).await?;
        return Ok(StepOutcome::Executed {
            node_status: node.status,
            run_status,
        });
    }

    let run = runs::get_run(pool, run_id)
        .await?
        .ok_or_else(|| EngineError::NotFound {
            entity: "workflow run",
            id: run_id.to_string(),
        })?;
    if run.status.is_terminal() {
        // Cancellation (or another terminal transition) landed while the
        // provider was in flight; the node's outcome stays persisted.
        return Ok(StepOutcome::RunTerminal {
            run_status: run.status,
        });
    }

    Ok(StepOutcome::Executed {
        node_status: node.status,
        run_status: run.status,
    })
}
