//! Routing-selection builder.
//!
//! Given the latest node rows, the full edge set, and the latest routing
//! decisions and artifacts, compute the *selected route* per completed
//! source node. Everything here is an in-memory join over loaded row
//! sets; the database is only touched by the caller.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use alphred_db::models::{
    DecisionType, EdgeKind, NodeStatus, PhaseArtifact, RouteOn, RoutingDecision, RunEdge, RunNode,
};

/// Stable rank for grouping edges by `route_on` in the selection order.
fn route_on_rank(route_on: RouteOn) -> u8 {
    match route_on {
        RouteOn::Success => 0,
        RouteOn::Failure => 1,
        RouteOn::Terminal => 2,
    }
}

/// The edge selection comparator:
/// `(source_run_node_id, route_on, priority, target_run_node_id, id)`.
pub fn edge_order(a: &RunEdge, b: &RunEdge) -> Ordering {
    a.source_run_node_id
        .cmp(&b.source_run_node_id)
        .then(route_on_rank(a.route_on).cmp(&route_on_rank(b.route_on)))
        .then(a.priority.cmp(&b.priority))
        .then(a.target_run_node_id.cmp(&b.target_run_node_id))
        .then(a.id.cmp(&b.id))
}

/// Parse a guard expression of the form `decision=<value>`.
///
/// Anything else (unknown key, unknown decision value) fails to parse and
/// the guard can never match.
pub fn parse_guard(expr: &str) -> Option<DecisionType> {
    let (key, value) = expr.split_once('=')?;
    if key.trim() != "decision" {
        return None;
    }
    value.trim().parse().ok()
}

/// Whether a success edge matches the (possibly absent) decision signal.
///
/// Guarded edges require an applicable decision equal to the guard value.
/// Unguarded `auto` edges match with no decision required; unguarded
/// non-auto edges match any present decision.
fn success_edge_matches(edge: &RunEdge, decision: Option<DecisionType>) -> bool {
    match edge.guard_expression.as_deref() {
        Some(expr) => match parse_guard(expr) {
            Some(want) => decision == Some(want),
            None => false,
        },
        None => edge.auto || decision.is_some(),
    }
}

/// Whether a failure edge matches. Failed sources usually carry no
/// decision, so unguarded failure edges always match; guarded ones match
/// against the decision if one applies.
fn failure_edge_matches(edge: &RunEdge, decision: Option<DecisionType>) -> bool {
    match edge.guard_expression.as_deref() {
        Some(expr) => match parse_guard(expr) {
            Some(want) => decision == Some(want),
            None => false,
        },
        None => true,
    }
}

/// The applicable-decision rule: the latest persisted decision counts only
/// if it is at least as new as the node's current attempt AND not older
/// than the node's latest artifact.
pub fn applicable_decision<'a>(
    node: &RunNode,
    decision: Option<&'a RoutingDecision>,
    latest_artifact: Option<&PhaseArtifact>,
) -> Option<&'a RoutingDecision> {
    let decision = decision?;
    if decision.attempt < node.attempt {
        return None;
    }
    if let Some(artifact) = latest_artifact {
        if decision.created_at < artifact.created_at {
            return None;
        }
    }
    Some(decision)
}

/// The selected-route map over a loaded run graph.
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    nodes_by_id: HashMap<i64, RunNode>,
    /// Incoming edges per target node, in selection order.
    pub incoming_by_target: HashMap<i64, Vec<RunEdge>>,
    /// Outgoing edges per source node, in selection order.
    pub outgoing_by_source: HashMap<i64, Vec<RunEdge>>,
    /// The single selected outgoing edge per source node.
    pub selected_edge_by_source: HashMap<i64, RunEdge>,
    /// Completed sources whose decision matched no outgoing edge.
    pub no_route_sources: HashSet<i64>,
    /// Completed sources with routable edges but no applicable decision.
    pub unresolved_sources: HashSet<i64>,
}

impl RouteMap {
    /// Build the map from loaded rows.
    ///
    /// `latest_decisions` and `latest_artifacts` are keyed by run-node id
    /// and hold the newest row per node.
    pub fn build(
        nodes: &[RunNode],
        edges: &[RunEdge],
        latest_decisions: &HashMap<i64, RoutingDecision>,
        latest_artifacts: &HashMap<i64, PhaseArtifact>,
    ) -> Self {
        let nodes_by_id: HashMap<i64, RunNode> =
            nodes.iter().map(|n| (n.id, n.clone())).collect();

        let mut incoming_by_target: HashMap<i64, Vec<RunEdge>> = HashMap::new();
        let mut outgoing_by_source: HashMap<i64, Vec<RunEdge>> = HashMap::new();
        for edge in edges {
            incoming_by_target
                .entry(edge.target_run_node_id)
                .or_default()
                .push(edge.clone());
            outgoing_by_source
                .entry(edge.source_run_node_id)
                .or_default()
                .push(edge.clone());
        }
        for list in incoming_by_target.values_mut() {
            list.sort_by(edge_order);
        }
        for list in outgoing_by_source.values_mut() {
            list.sort_by(edge_order);
        }

        let mut selected_edge_by_source = HashMap::new();
        let mut no_route_sources = HashSet::new();
        let mut unresolved_sources = HashSet::new();

        for node in nodes {
            let outgoing = match outgoing_by_source.get(&node.id) {
                Some(edges) => edges,
                None => continue,
            };
            let decision = applicable_decision(
                node,
                latest_decisions.get(&node.id),
                latest_artifacts.get(&node.id),
            )
            .map(|d| d.decision_type);

            match node.status {
                NodeStatus::Completed => {
                    // Dynamic spawner-to-child edges are all live and never
                    // participate in single-route selection.
                    let candidates: Vec<&RunEdge> = outgoing
                        .iter()
                        .filter(|e| {
                            e.route_on == RouteOn::Success
                                && e.edge_kind != EdgeKind::DynamicSpawnerToChild
                        })
                        .collect();
                    if candidates.is_empty() {
                        continue;
                    }
                    let selected = candidates
                        .iter()
                        .find(|e| success_edge_matches(e, decision));
                    match selected {
                        Some(edge) => {
                            selected_edge_by_source.insert(node.id, (**edge).clone());
                        }
                        None if decision.is_some() => {
                            no_route_sources.insert(node.id);
                        }
                        None => {
                            unresolved_sources.insert(node.id);
                        }
                    }
                }
                NodeStatus::Failed => {
                    let selected = outgoing
                        .iter()
                        .filter(|e| e.route_on == RouteOn::Failure)
                        .find(|e| failure_edge_matches(e, decision));
                    if let Some(edge) = selected {
                        selected_edge_by_source.insert(node.id, edge.clone());
                    }
                }
                _ => {}
            }
        }

        Self {
            nodes_by_id,
            incoming_by_target,
            outgoing_by_source,
            selected_edge_by_source,
            no_route_sources,
            unresolved_sources,
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: i64) -> Option<&RunNode> {
        self.nodes_by_id.get(&id)
    }

    /// The selected outgoing edge for a source, if one was chosen.
    pub fn selected_edge(&self, source_id: i64) -> Option<&RunEdge> {
        self.selected_edge_by_source.get(&source_id)
    }

    /// Whether any completed source produced a `no_route` condition.
    pub fn has_no_route(&self) -> bool {
        !self.no_route_sources.is_empty()
    }

    /// Whether any completed source still awaits an applicable decision.
    pub fn has_unresolved_decision(&self) -> bool {
        !self.unresolved_sources.is_empty()
    }

    /// Whether an incoming edge's route is runnable for its target:
    /// the source has the matching terminal status and the edge is either
    /// exempt from selection (dynamic spawner-to-child) or the selected
    /// route of its source.
    pub fn edge_route_runnable(&self, edge: &RunEdge) -> bool {
        let Some(source) = self.nodes_by_id.get(&edge.source_run_node_id) else {
            return false;
        };
        match edge.route_on {
            RouteOn::Success => {
                source.status == NodeStatus::Completed
                    && (edge.edge_kind == EdgeKind::DynamicSpawnerToChild
                        || self
                            .selected_edge(source.id)
                            .is_some_and(|selected| selected.id == edge.id))
            }
            RouteOn::Failure => {
                source.status == NodeStatus::Failed
                    && self
                        .selected_edge(source.id)
                        .is_some_and(|selected| selected.id == edge.id)
            }
            RouteOn::Terminal => source.status.is_terminal(),
        }
    }

    /// First-matching-edge evaluation for a hypothetical decision on a
    /// completed source: returns the edge that would be selected, if any.
    /// Used by the executor to synthesise `no_route` at persist time.
    pub fn evaluate_success_route(
        &self,
        source_id: i64,
        decision: Option<DecisionType>,
    ) -> Option<&RunEdge> {
        self.outgoing_by_source.get(&source_id)?.iter().find(|e| {
            e.route_on == RouteOn::Success
                && e.edge_kind != EdgeKind::DynamicSpawnerToChild
                && success_edge_matches(e, decision)
        })
    }

    /// Whether a source has any routable outgoing success edges (dynamic
    /// spawner-to-child edges excluded).
    pub fn has_success_candidates(&self, source_id: i64) -> bool {
        self.outgoing_by_source
            .get(&source_id)
            .is_some_and(|edges| {
                edges.iter().any(|e| {
                    e.route_on == RouteOn::Success
                        && e.edge_kind != EdgeKind::DynamicSpawnerToChild
                })
            })
    }
}
