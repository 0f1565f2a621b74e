use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal run statuses admit no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a run node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Terminal node statuses (the node produced an outcome or was
    /// resolved as unreachable).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

// ---------------------------------------------------------------------------

/// Structural role of a run node within the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Standard,
    Spawner,
    Join,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Spawner => "spawner",
            Self::Join => "join",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRole {
    type Err = NodeRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "spawner" => Ok(Self::Spawner),
            "join" => Ok(Self::Join),
            other => Err(NodeRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeRole`] string.
#[derive(Debug, Clone)]
pub struct NodeRoleParseError(pub String);

impl fmt::Display for NodeRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node role: {:?}", self.0)
    }
}

impl std::error::Error for NodeRoleParseError {}

// ---------------------------------------------------------------------------

/// What kind of executor a node binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Human,
    Tool,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Human => "human",
            Self::Tool => "tool",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeType {
    type Err = NodeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "human" => Ok(Self::Human),
            "tool" => Ok(Self::Tool),
            other => Err(NodeTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeType`] string.
#[derive(Debug, Clone)]
pub struct NodeTypeParseError(pub String);

impl fmt::Display for NodeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node type: {:?}", self.0)
    }
}

impl std::error::Error for NodeTypeParseError {}

// ---------------------------------------------------------------------------

/// Which source outcome an edge routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RouteOn {
    Success,
    Failure,
    Terminal,
}

impl fmt::Display for RouteOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

impl FromStr for RouteOn {
    type Err = RouteOnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "terminal" => Ok(Self::Terminal),
            other => Err(RouteOnParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RouteOn`] string.
#[derive(Debug, Clone)]
pub struct RouteOnParseError(pub String);

impl fmt::Display for RouteOnParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid route-on value: {:?}", self.0)
    }
}

impl std::error::Error for RouteOnParseError {}

// ---------------------------------------------------------------------------

/// Provenance of an edge: authored in the workflow tree, or materialised
/// at fan-out time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Tree,
    DynamicSpawnerToChild,
    DynamicChildToJoin,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tree => "tree",
            Self::DynamicSpawnerToChild => "dynamic_spawner_to_child",
            Self::DynamicChildToJoin => "dynamic_child_to_join",
        };
        f.write_str(s)
    }
}

impl FromStr for EdgeKind {
    type Err = EdgeKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tree" => Ok(Self::Tree),
            "dynamic_spawner_to_child" => Ok(Self::DynamicSpawnerToChild),
            "dynamic_child_to_join" => Ok(Self::DynamicChildToJoin),
            other => Err(EdgeKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EdgeKind`] string.
#[derive(Debug, Clone)]
pub struct EdgeKindParseError(pub String);

impl fmt::Display for EdgeKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid edge kind: {:?}", self.0)
    }
}

impl std::error::Error for EdgeKindParseError {}

// ---------------------------------------------------------------------------

/// Routing decision declared by a node's result (or synthesised by the
/// executor when no edge matches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Approved,
    ChangesRequested,
    Blocked,
    Retry,
    NoRoute,
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Blocked => "blocked",
            Self::Retry => "retry",
            Self::NoRoute => "no_route",
        };
        f.write_str(s)
    }
}

impl FromStr for DecisionType {
    type Err = DecisionTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            "blocked" => Ok(Self::Blocked),
            "retry" => Ok(Self::Retry),
            "no_route" => Ok(Self::NoRoute),
            other => Err(DecisionTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DecisionType`] string.
#[derive(Debug, Clone)]
pub struct DecisionTypeParseError(pub String);

impl fmt::Display for DecisionTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decision type: {:?}", self.0)
    }
}

impl std::error::Error for DecisionTypeParseError {}

// ---------------------------------------------------------------------------

/// Kind of artifact a node execution produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Report,
    Log,
    Note,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Report => "report",
            Self::Log => "log",
            Self::Note => "note",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactType {
    type Err = ArtifactTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(Self::Report),
            "log" => Ok(Self::Log),
            "note" => Ok(Self::Note),
            other => Err(ArtifactTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ArtifactType`] string.
#[derive(Debug, Clone)]
pub struct ArtifactTypeParseError(pub String);

impl fmt::Display for ArtifactTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid artifact type: {:?}", self.0)
    }
}

impl std::error::Error for ArtifactTypeParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a fan-out join barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BarrierStatus {
    Pending,
    Ready,
    Released,
}

impl BarrierStatus {
    /// A barrier is *active* while it is still accounting children.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

impl fmt::Display for BarrierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

impl FromStr for BarrierStatus {
    type Err = BarrierStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "released" => Ok(Self::Released),
            other => Err(BarrierStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BarrierStatus`] string.
#[derive(Debug, Clone)]
pub struct BarrierStatusParseError(pub String);

impl fmt::Display for BarrierStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid barrier status: {:?}", self.0)
    }
}

impl std::error::Error for BarrierStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow run -- one materialised execution of a workflow tree.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
    pub id: i64,
    pub workflow_tree_id: i64,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One scheduled execution of a tree node within a specific run.
///
/// Retries mutate the row in place: `attempt` increments and the
/// timestamps are cleared, so the row always describes the latest attempt
/// of the logical node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunNode {
    pub id: i64,
    pub workflow_run_id: i64,
    pub tree_node_id: i64,
    pub node_key: String,
    pub node_role: NodeRole,
    pub status: NodeStatus,
    pub sequence_index: i64,
    pub sequence_path: String,
    pub lineage_depth: i64,
    pub spawner_node_id: Option<i64>,
    pub join_node_id: Option<i64>,
    pub attempt: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub max_children: i64,
    pub node_type: NodeType,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub execution_permissions: Option<String>,
    pub error_handler_config: Option<JsonValue>,
    pub execution_metadata: Option<JsonValue>,
    pub prompt: String,
    pub prompt_content_type: String,
    pub created_at: DateTime<Utc>,
}

/// A directed edge of the run graph.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunEdge {
    pub id: i64,
    pub workflow_run_id: i64,
    pub source_run_node_id: i64,
    pub target_run_node_id: i64,
    pub route_on: RouteOn,
    pub priority: i64,
    pub auto: bool,
    pub guard_expression: Option<String>,
    pub edge_kind: EdgeKind,
}

/// A routing decision persisted for a run node attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoutingDecision {
    pub id: i64,
    pub workflow_run_id: i64,
    pub run_node_id: i64,
    pub decision_type: DecisionType,
    pub attempt: i64,
    pub raw_output: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// An artifact produced by a node execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhaseArtifact {
    pub id: i64,
    pub workflow_run_id: i64,
    pub run_node_id: i64,
    pub artifact_type: ArtifactType,
    pub content_type: String,
    pub content: String,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Per-fan-out accounting row tracking child terminal counts and
/// releasing the join.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunJoinBarrier {
    pub id: i64,
    pub workflow_run_id: i64,
    pub spawner_run_node_id: i64,
    pub join_run_node_id: i64,
    pub spawn_source_artifact_id: i64,
    pub expected_children: i64,
    pub terminal_children: i64,
    pub completed_children: i64,
    pub failed_children: i64,
    pub status: BarrierStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
