/// Error taxonomy for the execution engine
///
/// Plumbing errors travel as `anyhow::Error`; the enums here exist where a
/// caller has to branch on the kind of failure (fail the run, retry the job,
/// dead-letter the message).

use std::time::Duration;
use thiserror::Error;

/// Structural problems with a workflow graph. Any of these fails the run
/// before a single handler is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow contains a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("workflow contains disconnected nodes: {}", nodes.join(", "))]
    Disconnected { nodes: Vec<String> },

    #[error("workflow has no terminal output node")]
    MissingTerminal,

    #[error("edge references unknown node: {0}")]
    UnknownNode(String),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
}

/// A stored workflow definition could not be turned into a graph.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {workflow_id} has no resolvable nodes/edges representation")]
    Unresolvable { workflow_id: String },

    #[error("workflow {workflow_id} has a malformed {what}: {reason}")]
    Malformed {
        workflow_id: String,
        what: &'static str,
        reason: String,
    },
}

/// Failure of a single node dispatch.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The handler itself returned an error. The source is kept as-is.
    #[error("node '{node_id}' ({block_type}) failed in execution {execution_id}: {source}")]
    Handler {
        block_type: String,
        node_id: String,
        execution_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no handler registered for block type '{block_type}' (node '{node_id}')")]
    UnknownBlockType { block_type: String, node_id: String },

    #[error("node '{node_id}' timed out after {elapsed:?}")]
    Timeout { node_id: String, elapsed: Duration },

    #[error("node '{node_id}' was cancelled: {reason}")]
    Cancelled { node_id: String, reason: String },
}

/// How the consumer-level error handler should treat a failed job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Retrying cannot help (unresolvable workflow, undecodable payload).
    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),

    /// Infrastructure trouble; retried through the retry queue up to the cap.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),
}

impl JobError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::Permanent(_))
    }
}

impl From<DefinitionError> for JobError {
    fn from(err: DefinitionError) -> Self {
        JobError::Permanent(err.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Transient(err)
    }
}
