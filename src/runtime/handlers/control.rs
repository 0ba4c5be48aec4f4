/// Flow-control nodes: timed waits and human approval gates

use crate::runtime::handler::{EnhancedHandler, NodeContext, NodeOutcome};
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Waits `ms` milliseconds, then passes its first input through.
/// Gives up as soon as the run is cancelled.
#[derive(Debug, Default)]
pub struct DelayHandler;

#[async_trait]
impl EnhancedHandler for DelayHandler {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<NodeOutcome> {
        let ms = context.params().u64("ms").unwrap_or(0);
        context.logger().debug(&format!("⏳ Delaying {} for {}ms", node.id, ms));

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = context.cancellation().cancelled() => {
                return Err(anyhow::anyhow!("delay cancelled after run cancellation"));
            }
        }

        let passthrough = context.first_input().cloned().unwrap_or(Value::Null);
        Ok(NodeOutcome::Completed(json!({ "delayedMs": ms, "input": passthrough })))
    }
}

/// Suspends the run until it is resumed at this node.
///
/// `config.approved = true` lets the gate through on the first pass.
#[derive(Debug, Default)]
pub struct ApprovalHandler;

#[async_trait]
impl EnhancedHandler for ApprovalHandler {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<NodeOutcome> {
        let params = context.params();
        if context.resumed_here() || params.bool("approved") {
            context.logger().info(&format!("✅ Approval gate {} passed", node.id));
            let passthrough = context.first_input().cloned().unwrap_or(Value::Null);
            return Ok(NodeOutcome::Completed(json!({ "approved": true, "input": passthrough })));
        }

        let reason = params
            .str("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("awaiting approval at {}", node.id));
        Ok(NodeOutcome::Paused { reason })
    }
}
