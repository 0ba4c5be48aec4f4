/// Node executor
///
/// Resolves a node's block type to a handler, builds the per-node context from
/// the outputs of its direct dependencies, and invokes the handler under the
/// node timeout.

use crate::error::NodeError;
use crate::runtime::handler::{NodeContext, NodeHelpers, NodeOutcome, RunContext};
use crate::runtime::registry::HandlerRegistry;
use crate::workflow::graph::DependencyMap;
use crate::workflow::types::Node;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Outputs of the direct dependencies of `node_id`.
///
/// Dependencies without a recorded output are left out rather than treated as
/// an error; outputs of non-dependencies never leak in.
pub fn get_relevant_outputs(
    node_id: &str,
    dependency_map: &DependencyMap,
    all_outputs: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    dependency_map
        .dependencies(node_id)
        .iter()
        .filter_map(|dep| all_outputs.get(dep).map(|output| (dep.clone(), output.clone())))
        .collect()
}

/// Dispatches single nodes to their handlers
#[derive(Debug)]
pub struct NodeExecutor {
    registry: Arc<HandlerRegistry>,
    node_timeout: Duration,
    helpers: NodeHelpers,
}

impl NodeExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, node_timeout: Duration) -> Self {
        Self {
            registry,
            node_timeout,
            helpers: NodeHelpers::default(),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Execute a single node.
    ///
    /// `previous_outputs` are the node's relevant outputs (see
    /// `get_relevant_outputs`); `dependency_order` orders them for the
    /// structured item view.
    pub async fn execute(
        &self,
        node: &Node,
        run: &RunContext,
        previous_outputs: HashMap<String, Value>,
        dependency_order: &[String],
    ) -> Result<NodeOutcome, NodeError> {
        let handler = self
            .registry
            .resolve(&node.block_type)
            .ok_or_else(|| NodeError::UnknownBlockType {
                block_type: node.block_type.clone(),
                node_id: node.id.clone(),
            })?;

        let context = NodeContext::new(
            node,
            run,
            previous_outputs,
            dependency_order,
            self.helpers.clone(),
        );
        let logger = context.logger().clone();
        logger.info(&format!(
            "🚀 Starting node execution: {} (type: {})",
            node.id, node.block_type
        ));
        logger.debug(&format!("📥 {} input(s)", context.items().len()));

        let start_time = std::time::Instant::now();
        let result = tokio::time::timeout(self.node_timeout, handler.invoke(node, &context)).await;
        let duration = start_time.elapsed();

        match result {
            Ok(Ok(outcome)) => {
                match &outcome {
                    NodeOutcome::Completed(_) => {
                        logger.info(&format!("✅ Node execution completed: {} in {:?}", node.id, duration))
                    }
                    NodeOutcome::Paused { reason } => {
                        logger.info(&format!("⏸️ Node {} suspended the run: {}", node.id, reason))
                    }
                }
                Ok(outcome)
            }
            Ok(Err(source)) => {
                logger.error(&format!(
                    "❌ Node execution failed: {} in {:?} - Error: {}",
                    node.id, duration, source
                ));
                Err(NodeError::Handler {
                    block_type: node.block_type.clone(),
                    node_id: node.id.clone(),
                    execution_id: run.execution_id.clone(),
                    source,
                })
            }
            Err(_) => {
                logger.error(&format!("⏱️ Node {} exceeded its {:?} timeout", node.id, self.node_timeout));
                context.cancellation().cancel();
                Err(NodeError::Timeout {
                    node_id: node.id.clone(),
                    elapsed: duration,
                })
            }
        }
    }
}
