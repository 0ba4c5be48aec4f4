/// Trigger nodes hand the run's payload to the rest of the graph

use crate::runtime::handler::{NodeContext, SimpleHandler};
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct TriggerHandler;

#[async_trait]
impl SimpleHandler for TriggerHandler {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<Value> {
        context
            .logger()
            .debug(&format!("🎯 Trigger {} emitting run payload", node.id));
        Ok(context.payload().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handler::{NodeHelpers, RunContext};
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn emits_payload() {
        let node = Node::new("hook", "webhook", json!({})).trigger();
        let run = RunContext::new("e", "wf", "u", json!({"order": 42}));
        let ctx = NodeContext::new(&node, &run, HashMap::new(), &[], NodeHelpers::default());
        let output = TriggerHandler.execute(&node, &ctx).await.unwrap();
        assert_eq!(output, json!({"order": 42}));
    }
}
