/// Terminal collector: the run's result is whatever reaches the output node

use crate::runtime::handler::{NodeContext, SimpleHandler};
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct OutputHandler;

#[async_trait]
impl SimpleHandler for OutputHandler {
    async fn execute(&self, _node: &Node, context: &NodeContext) -> Result<Value> {
        let collected: Map<String, Value> = context
            .items()
            .iter()
            .map(|item| (item.source_node_id.clone(), item.json.clone()))
            .collect();
        Ok(Value::Object(collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handler::{NodeHelpers, RunContext};
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn collects_direct_inputs_by_source() {
        let node = Node::new("out", "output", json!({})).terminal();
        let run = RunContext::new("e", "wf", "u", json!({}));
        let inputs = HashMap::from([
            ("a".to_string(), json!({"x": 1})),
            ("b".to_string(), json!("done")),
        ]);
        let order = ["a".to_string(), "b".to_string()];
        let ctx = NodeContext::new(&node, &run, inputs, &order, NodeHelpers::default());
        let output = OutputHandler.execute(&node, &ctx).await.unwrap();
        assert_eq!(output, json!({"a": {"x": 1}, "b": "done"}));
    }
}
