/// Handler registry
///
/// Maps block types to handlers. Lookups are case-insensitive and lock-free
/// (ArcSwap, same hot-swap pattern as the workflow registry). When both an
/// enhanced and a legacy handler are registered under one name, the enhanced
/// one wins regardless of registration order.

use crate::runtime::handler::{EnhancedHandler, Handler, SimpleHandler};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

pub struct HandlerRegistry {
    handlers: ArcSwap<HashMap<String, Handler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Registry pre-populated with the built-in block types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::runtime::handlers::register_builtins(&registry);
        registry
    }

    pub fn register_simple(&self, block_type: &str, handler: impl SimpleHandler + 'static) {
        self.register(block_type, Handler::simple(handler));
    }

    pub fn register_enhanced(&self, block_type: &str, handler: impl EnhancedHandler + 'static) {
        self.register(block_type, Handler::enhanced(handler));
    }

    /// Register an already-wrapped handler
    pub fn register(&self, block_type: &str, handler: Handler) {
        let key = block_type.to_lowercase();
        let mut accepted = true;
        self.handlers.rcu(|current| {
            let mut next = (**current).clone();
            accepted = match next.get(&key) {
                Some(existing) if existing.is_enhanced() && !handler.is_enhanced() => false,
                _ => true,
            };
            if accepted {
                next.insert(key.clone(), handler.clone());
            }
            next
        });

        if accepted {
            tracing::debug!("🧩 Registered {:?} for block type '{}'", handler, key);
        } else {
            tracing::debug!(
                "🧩 Keeping enhanced handler for '{}', legacy registration ignored",
                key
            );
        }
    }

    /// Resolve a block type, ignoring case
    pub fn resolve(&self, block_type: &str) -> Option<Handler> {
        self.handlers.load().get(&block_type.to_lowercase()).cloned()
    }

    pub fn block_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.load().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("block_types", &self.block_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handler::{NodeContext, NodeOutcome};
    use crate::workflow::types::Node;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Legacy;
    struct Modern;

    #[async_trait]
    impl SimpleHandler for Legacy {
        async fn execute(&self, _node: &Node, _context: &NodeContext) -> Result<Value> {
            Ok(json!("legacy"))
        }
    }

    #[async_trait]
    impl EnhancedHandler for Modern {
        async fn execute(&self, _node: &Node, _context: &NodeContext) -> Result<NodeOutcome> {
            Ok(NodeOutcome::Completed(json!("enhanced")))
        }
    }

    #[test]
    fn resolution_is_case_insensitive() {
        let registry = HandlerRegistry::new();
        registry.register_simple("Mail", Legacy);
        assert!(registry.resolve("mail").is_some());
        assert!(registry.resolve("MAIL").is_some());
        assert!(registry.resolve("sms").is_none());
    }

    #[test]
    fn enhanced_wins_in_either_order() {
        let first = HandlerRegistry::new();
        first.register_simple("http", Legacy);
        first.register_enhanced("HTTP", Modern);
        assert!(first.resolve("http").unwrap().is_enhanced());

        let second = HandlerRegistry::new();
        second.register_enhanced("http", Modern);
        second.register_simple("http", Legacy);
        assert!(second.resolve("Http").unwrap().is_enhanced());
        assert_eq!(second.block_types(), vec!["http".to_string()]);
    }

    #[test]
    fn builtins_are_registered() {
        let registry = HandlerRegistry::with_builtins();
        for block_type in ["webhook", "output", "http", "script", "delay", "approval"] {
            assert!(registry.resolve(block_type).is_some(), "{block_type} missing");
        }
    }
}
