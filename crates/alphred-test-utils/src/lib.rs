//! Shared test utilities for alphred integration tests.
//!
//! Provides tempfile-backed databases with migrations applied (each test
//! gets its own isolated store), fixture helpers for building run
//! graphs, and a scripted provider that replays canned event sequences.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tempfile::TempDir;

use alphred_db::config::DbConfig;
use alphred_db::models::{
    EdgeKind, NodeRole, NodeType, RouteOn, RunEdge, RunNode, WorkflowRun,
};
use alphred_db::pool;
use alphred_db::queries::edges::{self, NewRunEdge};
use alphred_db::queries::nodes::{self, NewRunNode};
use alphred_db::queries::runs;

use alphred_core::executor::ExecutorDeps;
use alphred_core::provider::{
    Provider, ProviderError, ProviderEvent, ProviderEventStream, ProviderEventType,
    ProviderRegistry, ProviderRunOptions,
};
use alphred_core::workspace::FixedRootWorkspace;

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`; keep the [`TempDir`] alive for as long as the
/// pool is used.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("alphred-test.db"));
    let pool = pool::open(&config)
        .await
        .expect("failed to open test database");
    (pool, dir)
}

// ---------------------------------------------------------------------------
// Graph fixtures
// ---------------------------------------------------------------------------

/// Insert a workflow run (tree id 1) and return it.
pub async fn create_test_run(pool: &SqlitePool) -> WorkflowRun {
    runs::insert_run(pool, 1)
        .await
        .expect("failed to insert test run")
}

fn base_node(run_id: i64, key: &str, seq: i64) -> NewRunNode {
    NewRunNode {
        workflow_run_id: run_id,
        tree_node_id: seq,
        node_key: key.to_string(),
        node_role: NodeRole::Standard,
        sequence_index: seq,
        sequence_path: format!("{seq:04}"),
        lineage_depth: 0,
        spawner_node_id: None,
        join_node_id: None,
        max_retries: 0,
        max_children: 0,
        node_type: NodeType::Agent,
        provider: Some("scripted".to_string()),
        model: None,
        prompt: format!("work on {key}"),
        prompt_content_type: "text/markdown".to_string(),
    }
}

/// Insert a standard agent node.
pub async fn add_agent_node(pool: &SqlitePool, run_id: i64, key: &str, seq: i64) -> RunNode {
    nodes::insert_node(pool, &base_node(run_id, key, seq))
        .await
        .expect("failed to insert agent node")
}

/// Insert a standard agent node with a retry budget.
pub async fn add_agent_node_with_retries(
    pool: &SqlitePool,
    run_id: i64,
    key: &str,
    seq: i64,
    max_retries: i64,
) -> RunNode {
    let new = NewRunNode {
        max_retries,
        ..base_node(run_id, key, seq)
    };
    nodes::insert_node(pool, &new)
        .await
        .expect("failed to insert agent node")
}

/// Insert a spawner node with a fan-out cap.
pub async fn add_spawner_node(
    pool: &SqlitePool,
    run_id: i64,
    key: &str,
    seq: i64,
    max_children: i64,
) -> RunNode {
    let new = NewRunNode {
        node_role: NodeRole::Spawner,
        max_children,
        ..base_node(run_id, key, seq)
    };
    nodes::insert_node(pool, &new)
        .await
        .expect("failed to insert spawner node")
}

/// Insert a join node.
pub async fn add_join_node(pool: &SqlitePool, run_id: i64, key: &str, seq: i64) -> RunNode {
    let new = NewRunNode {
        node_role: NodeRole::Join,
        ..base_node(run_id, key, seq)
    };
    nodes::insert_node(pool, &new)
        .await
        .expect("failed to insert join node")
}

/// Insert a human approval node (no provider invocation).
pub async fn add_human_node(pool: &SqlitePool, run_id: i64, key: &str, seq: i64) -> RunNode {
    let new = NewRunNode {
        node_type: NodeType::Human,
        provider: None,
        ..base_node(run_id, key, seq)
    };
    nodes::insert_node(pool, &new)
        .await
        .expect("failed to insert human node")
}

/// Insert a success edge. `guard` is a `decision=<value>` expression;
/// pass `auto = true` for an unguarded always-on edge.
pub async fn add_success_edge(
    pool: &SqlitePool,
    run_id: i64,
    source: i64,
    target: i64,
    priority: i64,
    guard: Option<&str>,
    auto: bool,
) -> RunEdge {
    edges::insert_edge(
        pool,
        &NewRunEdge {
            workflow_run_id: run_id,
            source_run_node_id: source,
            target_run_node_id: target,
            route_on: RouteOn::Success,
            priority,
            auto,
            guard_expression: guard.map(str::to_owned),
            edge_kind: EdgeKind::Tree,
        },
    )
    .await
    .expect("failed to insert success edge")
}

/// Insert a failure edge.
pub async fn add_failure_edge(
    pool: &SqlitePool,
    run_id: i64,
    source: i64,
    target: i64,
    priority: i64,
) -> RunEdge {
    edges::insert_edge(
        pool,
        &NewRunEdge {
            workflow_run_id: run_id,
            source_run_node_id: source,
            target_run_node_id: target,
            route_on: RouteOn::Failure,
            priority,
            auto: true,
            guard_expression: None,
            edge_kind: EdgeKind::Tree,
        },
    )
    .await
    .expect("failed to insert failure edge")
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// One step of a scripted provider run.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Event(ProviderEvent),
    Error(ProviderError),
    /// Stall the stream forever (for timeout tests).
    Stall,
}

/// A provider that replays canned scripts, one per invocation, in order.
///
/// An invocation with no remaining script yields an empty stream (which
/// the phase runner reports as a missing result).
pub struct ScriptedProvider {
    provider_name: String,
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            provider_name: name.to_string(),
            scripts: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a script for the next invocation.
    pub fn push_script(&self, items: Vec<ScriptItem>) {
        self.scripts.lock().unwrap().push_back(items);
    }

    /// Builder-style variant of [`Self::push_script`].
    pub fn with_script(self, items: Vec<ScriptItem>) -> Self {
        self.push_script(items);
        self
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn run(&self, _prompt: &str, _options: &ProviderRunOptions) -> ProviderEventStream {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Box::pin(async_stream::stream! {
            for item in script {
                match item {
                    ScriptItem::Event(event) => yield Ok(event),
                    ScriptItem::Error(err) => {
                        yield Err(err);
                        return;
                    }
                    ScriptItem::Stall => futures::future::pending::<()>().await,
                }
            }
        })
    }
}

/// A terminal `result` event, optionally declaring a routing decision
/// under the canonical metadata key.
pub fn result_event(content: &str, decision: Option<&str>) -> ProviderEvent {
    let event = ProviderEvent::new(ProviderEventType::Result, content);
    match decision {
        Some(d) => event.with_metadata(serde_json::json!({ "routingDecision": d })),
        None => event.with_metadata(serde_json::json!({})),
    }
}

/// A minimal successful script: one assistant event, then the result.
pub fn result_script(content: &str, decision: Option<&str>) -> Vec<ScriptItem> {
    vec![
        ScriptItem::Event(ProviderEvent::new(ProviderEventType::Assistant, "working")),
        ScriptItem::Event(result_event(content, decision)),
    ]
}

/// A script that fails terminally with the given error.
pub fn failure_script(err: ProviderError) -> Vec<ScriptItem> {
    vec![
        ScriptItem::Event(ProviderEvent::new(ProviderEventType::Assistant, "working")),
        ScriptItem::Error(err),
    ]
}

// ---------------------------------------------------------------------------
// Executor wiring
// ---------------------------------------------------------------------------

/// Build executor deps around a scripted provider and a fixed-root
/// workspace under `workspace_root`.
pub fn test_deps(provider: ScriptedProvider, workspace_root: &Path) -> ExecutorDeps {
    let mut registry = ProviderRegistry::new();
    registry.register(provider);
    ExecutorDeps {
        providers: Arc::new(registry),
        workspace: Arc::new(FixedRootWorkspace::new(workspace_root)),
        repo_name: "demo".to_string(),
        observer: None,
        provider_timeout: None,
    }
}
