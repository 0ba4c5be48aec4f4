/// Handler shapes and the per-node execution context
///
/// Two handler shapes exist side by side:
/// - `SimpleHandler`: `(node, context) -> output`
/// - `EnhancedHandler`: works on structured input items, parameter and helper
///   accessors, and may voluntarily suspend the run
///
/// Both are wrapped into the `Handler` tagged union when registered, so the
/// executor only ever calls `Handler::invoke`.

use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a node dispatch produced
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Output recorded for downstream nodes
    Completed(Value),
    /// The handler suspended the run; it can be resumed later
    Paused { reason: String },
}

/// Legacy handler shape
#[async_trait]
pub trait SimpleHandler: Send + Sync {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<Value>;
}

/// Richer handler shape with structured items and voluntary suspension
#[async_trait]
pub trait EnhancedHandler: Send + Sync {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<NodeOutcome>;
}

/// A registered handler. Cloning is cheap.
#[derive(Clone)]
pub enum Handler {
    Simple(Arc<dyn SimpleHandler>),
    Enhanced(Arc<dyn EnhancedHandler>),
}

impl Handler {
    pub fn simple(handler: impl SimpleHandler + 'static) -> Self {
        Handler::Simple(Arc::new(handler))
    }

    pub fn enhanced(handler: impl EnhancedHandler + 'static) -> Self {
        Handler::Enhanced(Arc::new(handler))
    }

    pub fn is_enhanced(&self) -> bool {
        matches!(self, Handler::Enhanced(_))
    }

    /// Run the handler. Errors are returned exactly as the handler raised them.
    pub async fn invoke(&self, node: &Node, context: &NodeContext) -> Result<NodeOutcome> {
        match self {
            Handler::Simple(handler) => handler.execute(node, context).await.map(NodeOutcome::Completed),
            Handler::Enhanced(handler) => handler.execute(node, context).await,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Simple(_) => f.write_str("Handler::Simple"),
            Handler::Enhanced(_) => f.write_str("Handler::Enhanced"),
        }
    }
}

/// Logger bound to one node of one execution
#[derive(Debug, Clone)]
pub struct NodeLogger {
    span: tracing::Span,
}

impl NodeLogger {
    pub fn new(execution_id: &str, node_id: &str, block_type: &str) -> Self {
        Self {
            span: tracing::info_span!(
                "node",
                execution_id = %execution_id,
                node_id = %node_id,
                block_type = %block_type
            ),
        }
    }

    pub fn debug(&self, message: &str) {
        self.span.in_scope(|| tracing::debug!("{}", message));
    }

    pub fn info(&self, message: &str) {
        self.span.in_scope(|| tracing::info!("{}", message));
    }

    pub fn warn(&self, message: &str) {
        self.span.in_scope(|| tracing::warn!("{}", message));
    }

    pub fn error(&self, message: &str) {
        self.span.in_scope(|| tracing::error!("{}", message));
    }
}

/// Read access to a node's configuration
#[derive(Debug, Clone)]
pub struct ParamAccessor {
    config: Value,
}

impl ParamAccessor {
    pub fn new(config: Value) -> Self {
        Self { config }
    }

    pub fn raw(&self) -> &Value {
        &self.config
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.config.get(name).filter(|value| !value.is_null())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn required_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .ok_or_else(|| anyhow::anyhow!("missing '{}' parameter", name))
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_u64)
    }

    pub fn bool(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// JSONPath query over the whole config (e.g. `$.headers.*`)
    pub fn select(&self, path: &str) -> Result<Vec<Value>> {
        let selected = jsonpath_lib::select(&self.config, path)
            .map_err(|e| anyhow::anyhow!("invalid parameter path '{}': {:?}", path, e))?;
        Ok(selected.into_iter().cloned().collect())
    }
}

/// One upstream output as seen by an enhanced handler
#[derive(Debug, Clone, PartialEq)]
pub struct InputItem {
    pub source_node_id: String,
    pub json: Value,
}

/// Shared resources available to handlers
#[derive(Debug, Clone, Default)]
pub struct NodeHelpers {
    pub http: reqwest::Client,
}

/// Identity and shared state of the run a node belongs to
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    /// Payload the run was triggered with
    pub payload: Value,
    /// Node the run was resumed at, if any
    pub resume_from_node_id: Option<String>,
    /// Cancelled when the run exceeds its overall timeout
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(execution_id: &str, workflow_id: &str, user_id: &str, payload: Value) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            payload,
            resume_from_node_id: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Everything a handler sees while executing one node
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub node_id: String,
    pub block_type: String,
    logger: NodeLogger,
    params: ParamAccessor,
    inputs: HashMap<String, Value>,
    items: Vec<InputItem>,
    payload: Value,
    resumed_here: bool,
    cancellation: CancellationToken,
    helpers: NodeHelpers,
}

impl NodeContext {
    /// `inputs` are the outputs of the node's direct dependencies, `order`
    /// the dependency order used for the structured item list.
    pub fn new(
        node: &Node,
        run: &RunContext,
        inputs: HashMap<String, Value>,
        order: &[String],
        helpers: NodeHelpers,
    ) -> Self {
        let items = order
            .iter()
            .filter_map(|id| {
                inputs.get(id).map(|json| InputItem {
                    source_node_id: id.clone(),
                    json: json.clone(),
                })
            })
            .collect();

        Self {
            execution_id: run.execution_id.clone(),
            workflow_id: run.workflow_id.clone(),
            user_id: run.user_id.clone(),
            node_id: node.id.clone(),
            block_type: node.block_type.clone(),
            logger: NodeLogger::new(&run.execution_id, &node.id, &node.block_type),
            params: ParamAccessor::new(node.config.clone()),
            inputs,
            items,
            payload: run.payload.clone(),
            resumed_here: run.resume_from_node_id.as_deref() == Some(node.id.as_str()),
            cancellation: run.cancellation.child_token(),
            helpers,
        }
    }

    pub fn logger(&self) -> &NodeLogger {
        &self.logger
    }

    pub fn params(&self) -> &ParamAccessor {
        &self.params
    }

    /// Direct dependency outputs keyed by upstream node id
    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    /// Direct dependency outputs in dependency order
    pub fn items(&self) -> &[InputItem] {
        &self.items
    }

    /// First upstream output, the common case for single-input nodes
    pub fn first_input(&self) -> Option<&Value> {
        self.items.first().map(|item| &item.json)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// True when the run was resumed at exactly this node
    pub fn resumed_here(&self) -> bool {
        self.resumed_here
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn helpers(&self) -> &NodeHelpers {
        &self.helpers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl SimpleHandler for Echo {
        async fn execute(&self, node: &Node, _context: &NodeContext) -> Result<Value> {
            Ok(json!({"echo": node.id}))
        }
    }

    #[test]
    fn params_support_jsonpath_selection() {
        let params = ParamAccessor::new(json!({
            "url": "https://example.com",
            "headers": {"a": "1"},
            "retries": 3,
            "empty": null
        }));
        assert_eq!(params.str("url"), Some("https://example.com"));
        assert_eq!(params.u64("retries"), Some(3));
        assert!(params.get("empty").is_none());
        assert!(params.required_str("missing").is_err());
        assert_eq!(params.select("$.headers.a").unwrap(), vec![json!("1")]);
    }

    #[tokio::test]
    async fn simple_handlers_complete_with_their_output() {
        let node = Node::new("n1", "echo", json!({}));
        let run = RunContext::new("e1", "wf", "u1", json!({}));
        let ctx = NodeContext::new(&node, &run, HashMap::new(), &[], NodeHelpers::default());
        let outcome = Handler::simple(Echo).invoke(&node, &ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Completed(json!({"echo": "n1"})));
    }

    #[test]
    fn items_follow_dependency_order_and_skip_missing() {
        let node = Node::new("c", "noop", json!({}));
        let mut run = RunContext::new("e1", "wf", "u1", json!({}));
        run.resume_from_node_id = Some("c".into());
        let inputs = HashMap::from([("b".to_string(), json!(2)), ("a".to_string(), json!(1))]);
        let order = ["a".to_string(), "missing".to_string(), "b".to_string()];
        let ctx = NodeContext::new(&node, &run, inputs, &order, NodeHelpers::default());
        let sources: Vec<&str> = ctx.items().iter().map(|i| i.source_node_id.as_str()).collect();
        assert_eq!(sources, vec!["a", "b"]);
        assert_eq!(ctx.first_input(), Some(&json!(1)));
        assert!(ctx.resumed_here());
    }
}
