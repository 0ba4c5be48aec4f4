/// Hot-reload workflow registry using ArcSwap
///
/// Resolved graphs are cached in a lock-free map in front of the store. Each
/// update swaps the entire map pointer, so workers reading a graph never
/// block on a reload.

use crate::error::DefinitionError;
use crate::store::Store;
use crate::workflow::definition::resolve_graph;
use crate::workflow::types::WorkflowGraph;
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

/// Workflow lookup service consumed by the worker
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    /// Load a workflow graph. `DefinitionError`s mean retrying will not help;
    /// any other error is treated as transient.
    async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<WorkflowGraph>>;
}

/// Lock-free cache of resolved workflow graphs
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: resolved graph
    workflows: ArcSwap<HashMap<String, Arc<WorkflowGraph>>>,
    store: Arc<dyn Store>,
}

impl WorkflowRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            store,
        }
    }

    /// Lock-free cache read
    pub fn cached(&self, workflow_id: &str) -> Option<Arc<WorkflowGraph>> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Re-read a workflow from the store and swap it into the cache
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<Arc<WorkflowGraph>> {
        let definition = self
            .store
            .get_workflow_definition(workflow_id)
            .await?
            .ok_or_else(|| DefinitionError::NotFound(workflow_id.to_string()))?;
        let graph = Arc::new(resolve_graph(workflow_id, &definition)?);

        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(workflow_id.to_string(), Arc::clone(&graph));
            next
        });

        tracing::info!("🔄 Loaded workflow into registry: {}", workflow_id);
        Ok(graph)
    }

    /// Drop a workflow from the cache; the next lookup reloads it
    pub fn remove_workflow(&self, workflow_id: &str) {
        let mut removed = false;
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(workflow_id).is_some();
            next
        });
        if removed {
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
    }

    pub fn len(&self) -> usize {
        self.workflows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.load().is_empty()
    }
}

#[async_trait]
impl WorkflowSource for WorkflowRegistry {
    async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<WorkflowGraph>> {
        if let Some(graph) = self.cached(workflow_id) {
            return Ok(graph);
        }
        self.reload_workflow(workflow_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn caches_after_first_lookup() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_workflow(
                "wf",
                "wf",
                &json!({"nodes": [{"id": "a", "type": "output", "role": "terminal"}], "edges": []}),
            )
            .await
            .unwrap();
        let registry = WorkflowRegistry::new(store.clone());
        assert!(registry.is_empty());

        let graph = registry.get_workflow("wf").await.unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(registry.len(), 1);

        registry.remove_workflow("wf");
        assert!(registry.cached("wf").is_none());
    }

    #[tokio::test]
    async fn missing_workflow_is_a_definition_error() {
        let registry = WorkflowRegistry::new(Arc::new(MemoryStore::new()));
        let err = registry.get_workflow("ghost").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DefinitionError>(),
            Some(DefinitionError::NotFound(_))
        ));
    }
}
