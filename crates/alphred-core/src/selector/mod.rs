//! Next-runnable-node selection and terminal-outcome resolution.

use alphred_db::models::{NodeRole, NodeStatus, RunJoinBarrier, RunNode};
use tracing::debug;

use crate::routing::RouteMap;

/// Result of scanning a run graph for work.
#[derive(Debug, Clone)]
pub struct Selection {
    /// The first runnable node in selection order, if any.
    pub next_runnable: Option<RunNode>,
    /// A completed source's decision matched no outgoing edge.
    pub has_no_route: bool,
    /// A completed source has routable edges but no applicable decision.
    pub has_unresolved_decision: bool,
}

/// What a run resolves to when nothing is runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalResolution {
    /// Every reachable node finished; remaining pending nodes are
    /// unreachable and get skipped.
    Completed,
    /// A failure, no-route, or unresolved decision blocks the run.
    Failed,
}

/// Whether a single node is runnable right now.
///
/// A node is runnable iff its latest attempt is `pending`, every incoming
/// edge's route is runnable, and -- for join nodes -- no active barrier is
/// still waiting on children.
pub fn is_runnable(node: &RunNode, routes: &RouteMap, barriers: &[RunJoinBarrier]) -> bool {
    if node.status != NodeStatus::Pending {
        return false;
    }

    if let Some(incoming) = routes.incoming_by_target.get(&node.id) {
        if !incoming.iter().all(|edge| routes.edge_route_runnable(edge)) {
            return false;
        }
    }

    if node.node_role == NodeRole::Join {
        let active: Vec<&RunJoinBarrier> = barriers
            .iter()
            .filter(|b| b.join_run_node_id == node.id && b.status.is_active())
            .collect();
        if active
            .iter()
            .any(|b| b.status != alphred_db::models::BarrierStatus::Ready)
        {
            return false;
        }
    }

    true
}

/// Scan the graph for the next runnable node.
///
/// Candidates are ordered by `(sequence_path, sequence_index, node_key,
/// id)` ascending; the first runnable one wins. The no-route and
/// unresolved-decision flags are reported independently -- they become
/// terminal conditions only when nothing is runnable.
pub fn select_next_runnable(
    nodes: &[RunNode],
    routes: &RouteMap,
    barriers: &[RunJoinBarrier],
) -> Selection {
    let mut candidates: Vec<&RunNode> = nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Pending)
        .collect();
    candidates.sort_by(|a, b| {
        a.sequence_path
            .cmp(&b.sequence_path)
            .then(a.sequence_index.cmp(&b.sequence_index))
            .then(a.node_key.cmp(&b.node_key))
            .then(a.id.cmp(&b.id))
    });

    let next_runnable = candidates
        .into_iter()
        .find(|n| is_runnable(n, routes, barriers))
        .cloned();

    if let Some(node) = &next_runnable {
        debug!(node_id = node.id, node_key = %node.node_key, "next runnable node");
    }

    Selection {
        next_runnable,
        has_no_route: routes.has_no_route(),
        has_unresolved_decision: routes.has_unresolved_decision(),
    }
}

/// Decide the run's terminal outcome when no node is runnable.
///
/// Returns `None` while a node is still `running` (an in-flight step owns
/// the run). A `failed` latest attempt, a no-route condition, or an
/// unresolved decision resolves to `Failed`; otherwise everything
/// reachable finished and the run resolves to `Completed`.
pub fn resolve_terminal(nodes: &[RunNode], selection: &Selection) -> Option<TerminalResolution> {
    if nodes.iter().any(|n| n.status == NodeStatus::Running) {
        return None;
    }
    if selection.has_no_route || selection.has_unresolved_decision {
        return Some(TerminalResolution::Failed);
    }
    if nodes.iter().any(|n| n.status == NodeStatus::Failed) {
        return Some(TerminalResolution::Failed);
    }
    Some(TerminalResolution::Completed)
}
