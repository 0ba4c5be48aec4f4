/// Core workflow and execution type definitions
///
/// Workflow graphs are immutable for the duration of a run. Execution and
/// node execution records are the persisted view of a run's state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A workflow definition: typed nodes connected by data-flow edges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// Nodes in declaration order. The order breaks scheduling ties.
    pub nodes: Vec<Node>,
    /// Data-flow edges (source feeds target)
    pub edges: Vec<Edge>,
}

/// A single unit of work in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "node1", "send-mail")
    pub id: String,
    /// Block type used to resolve the handler (e.g., "webhook", "http", "script")
    #[serde(rename = "type")]
    pub block_type: String,
    /// Handler-specific configuration
    #[serde(default)]
    pub config: Value,
    /// Explicit role marker; only `Terminal` satisfies the output-node check
    #[serde(default)]
    pub role: NodeRole,
}

/// Explicit role of a node within its workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Entry point fed by the trigger payload
    Trigger,
    /// Ordinary processing node
    #[default]
    Step,
    /// Output node; a workflow needs at least one
    #[serde(alias = "output")]
    Terminal,
}

/// Connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream node id
    #[serde(alias = "from")]
    pub source: String,
    /// Downstream node id
    #[serde(alias = "to")]
    pub target: String,
}

impl Node {
    pub fn new(id: impl Into<String>, block_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            config,
            role: NodeRole::Step,
        }
    }

    /// Mark the node as the workflow's output
    pub fn terminal(mut self) -> Self {
        self.role = NodeRole::Terminal;
        self
    }

    pub fn trigger(mut self) -> Self {
        self.role = NodeRole::Trigger;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.role == NodeRole::Terminal
    }
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl WorkflowGraph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

/// Lifecycle of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "paused" => Some(ExecutionStatus::Paused),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    /// Forward-only transitions. Running -> Running covers redelivery of a
    /// message whose previous attempt died mid-run. Failed/Paused only go back
    /// to Running through an explicit resume.
    pub fn can_transition_to(&self, next: ExecutionStatus, resuming: bool) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Running | Completed | Failed | Paused) => true,
            (Failed | Paused, Running) => resuming,
            _ => false,
        }
    }
}

/// Persisted record of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resume_from_node_id: Option<String>,
    /// Node id -> output of every node that completed
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            resume_from_node_id: None,
            outputs: HashMap::new(),
            error: None,
        }
    }

    /// Apply a status change, refusing transitions that would move the run
    /// backwards. Returns false when the transition was refused.
    pub fn transition(&mut self, next: ExecutionStatus, resuming: bool) -> bool {
        if self.status == next && next != ExecutionStatus::Running {
            return true;
        }
        if !self.status.can_transition_to(next, resuming) {
            tracing::warn!(
                "⚠️ Refusing execution {} transition {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            );
            return false;
        }
        let now = Utc::now();
        match next {
            ExecutionStatus::Running => {
                self.started_at = Some(now);
                self.finished_at = None;
                self.error = None;
            }
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Paused => {
                self.finished_at = Some(now);
            }
            ExecutionStatus::Pending => {}
        }
        self.status = next;
        true
    }
}

/// Status of a single node dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Paused => "paused",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(NodeStatus::Running),
            "completed" => Some(NodeStatus::Completed),
            "failed" => Some(NodeStatus::Failed),
            "paused" => Some(NodeStatus::Paused),
            _ => None,
        }
    }
}

/// Persisted record of one node dispatch within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub execution_id: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl NodeExecutionRecord {
    pub fn started(execution_id: &str, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            execution_id: execution_id.to_string(),
            status: NodeStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            output: None,
            error: None,
        }
    }

    pub fn complete(mut self, status: NodeStatus, output: Option<Value>, error: Option<String>) -> Self {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.output = output;
        self.error = error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_deserializes_type_and_role_aliases() {
        let node: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "mail",
            "config": {"to": "ops@example.com"},
            "role": "output"
        }))
        .unwrap();
        assert_eq!(node.block_type, "mail");
        assert!(node.is_terminal());

        let edge: Edge = serde_json::from_value(json!({"from": "a", "to": "b"})).unwrap();
        assert_eq!(edge, Edge::new("a", "b"));
    }

    #[test]
    fn status_transitions_are_monotonic_except_resume() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running, false));
        assert!(Running.can_transition_to(Paused, false));
        assert!(!Completed.can_transition_to(Running, false));
        assert!(!Completed.can_transition_to(Running, true));
        assert!(!Paused.can_transition_to(Running, false));
        assert!(Paused.can_transition_to(Running, true));
        assert!(Failed.can_transition_to(Running, true));
        assert!(!Failed.can_transition_to(Completed, false));
    }

    #[test]
    fn refused_transition_leaves_execution_untouched() {
        let mut execution = Execution::new("e1", "wf", "u1");
        assert!(execution.transition(ExecutionStatus::Running, false));
        assert!(execution.transition(ExecutionStatus::Completed, false));
        assert!(!execution.transition(ExecutionStatus::Running, false));
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.finished_at.is_some());
    }
}
