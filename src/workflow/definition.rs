/// Stored workflow definition resolution
///
/// Workflow definitions have been saved in several historical shapes. This
/// module normalizes any of them into a `WorkflowGraph`.

use crate::error::DefinitionError;
use crate::workflow::types::{Edge, Node, NodeRole, WorkflowGraph};
use serde_json::Value;

/// Resolve a stored definition into a graph.
///
/// Shapes tried, in order:
/// - `{ "nodes": [...], "edges": [...] }`
/// - `{ "graph": { "nodes", "edges" } }`
/// - `{ "definition": { "nodes", "edges" } }` (object or JSON-encoded string)
/// - `{ "blocks": [...], "connections": [...] }`
pub fn resolve_graph(workflow_id: &str, definition: &Value) -> Result<WorkflowGraph, DefinitionError> {
    let candidates = [
        pair(definition, "nodes", "edges"),
        definition.get("graph").and_then(|g| pair(g, "nodes", "edges")),
        nested_definition(definition).and_then(|d| pair(&d, "nodes", "edges")),
        pair(definition, "blocks", "connections"),
    ];

    let Some((raw_nodes, raw_edges)) = candidates.into_iter().flatten().next() else {
        tracing::error!("❌ No resolvable graph representation for workflow {}", workflow_id);
        return Err(DefinitionError::Unresolvable {
            workflow_id: workflow_id.to_string(),
        });
    };

    let nodes = raw_nodes
        .iter()
        .enumerate()
        .map(|(idx, raw)| parse_node(workflow_id, idx, raw))
        .collect::<Result<Vec<_>, _>>()?;
    let edges = raw_edges
        .iter()
        .enumerate()
        .map(|(idx, raw)| parse_edge(workflow_id, idx, raw))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(
        "📊 Resolved workflow {} with {} nodes and {} edges",
        workflow_id,
        nodes.len(),
        edges.len()
    );

    Ok(WorkflowGraph::new(nodes, edges))
}

fn pair(value: &Value, nodes_key: &str, edges_key: &str) -> Option<(Vec<Value>, Vec<Value>)> {
    let nodes = value.get(nodes_key)?.as_array()?;
    // Definitions saved before any connection existed omit the edge list.
    let edges = match value.get(edges_key) {
        Some(Value::Array(edges)) => edges.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return None,
    };
    Some((nodes.clone(), edges))
}

fn nested_definition(value: &Value) -> Option<Value> {
    match value.get("definition")? {
        Value::String(encoded) => serde_json::from_str(encoded).ok(),
        Value::Object(_) => value.get("definition").cloned(),
        _ => None,
    }
}

fn parse_node(workflow_id: &str, idx: usize, raw: &Value) -> Result<Node, DefinitionError> {
    let malformed = |reason: String| DefinitionError::Malformed {
        workflow_id: workflow_id.to_string(),
        what: "node",
        reason,
    };

    let id = match raw.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(malformed(format!("node #{idx} has no id"))),
    };

    let block_type = first_str(raw, &[&["type"], &["blockType"], &["data", "type"], &["node_type"]])
        .ok_or_else(|| malformed(format!("node '{id}' has no type")))?;

    let config = first_value(raw, &[&["config"], &["data", "config"], &["params"], &["data"]])
        .unwrap_or_else(|| Value::Object(Default::default()));

    let role = match first_str(raw, &[&["role"], &["data", "role"]]).as_deref() {
        Some("terminal") | Some("output") => NodeRole::Terminal,
        Some("trigger") => NodeRole::Trigger,
        _ if first_bool(raw, &[&["isTerminal"], &["isOutput"], &["data", "isOutput"], &["data", "isTerminal"]]) => {
            NodeRole::Terminal
        }
        _ => NodeRole::Step,
    };

    Ok(Node {
        id,
        block_type,
        config,
        role,
    })
}

fn parse_edge(workflow_id: &str, idx: usize, raw: &Value) -> Result<Edge, DefinitionError> {
    let source = first_str(raw, &[&["source"], &["from"], &["sourceId"]]);
    let target = first_str(raw, &[&["target"], &["to"], &["targetId"]]);
    match (source, target) {
        (Some(source), Some(target)) => Ok(Edge { source, target }),
        _ => Err(DefinitionError::Malformed {
            workflow_id: workflow_id.to_string(),
            what: "edge",
            reason: format!("edge #{idx} is missing source or target"),
        }),
    }
}

fn lookup<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(raw, |current, key| current.get(*key))
}

fn first_value(raw: &Value, paths: &[&[&str]]) -> Option<Value> {
    paths
        .iter()
        .filter_map(|path| lookup(raw, path))
        .find(|value| !value.is_null())
        .cloned()
}

fn first_str(raw: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| match lookup(raw, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_bool(raw: &Value, paths: &[&[&str]]) -> bool {
    paths
        .iter()
        .any(|path| lookup(raw, path).and_then(Value::as_bool).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_current_shape() {
        let graph = resolve_graph(
            "wf",
            &json!({
                "nodes": [
                    {"id": "1", "type": "webhook", "role": "trigger"},
                    {"id": "2", "type": "output", "role": "terminal", "config": {"k": 1}}
                ],
                "edges": [{"source": "1", "target": "2"}]
            }),
        )
        .unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[0].role, NodeRole::Trigger);
        assert!(graph.nodes[1].is_terminal());
        assert_eq!(graph.nodes[1].config, json!({"k": 1}));
        assert_eq!(graph.edges, vec![Edge::new("1", "2")]);
    }

    #[test]
    fn resolves_encoded_definition_string() {
        let encoded = json!({
            "nodes": [{"id": 1, "data": {"type": "http", "isOutput": true, "config": {"url": "x"}}}],
            "edges": []
        })
        .to_string();
        let graph = resolve_graph("wf", &json!({ "definition": encoded })).unwrap();
        assert_eq!(graph.nodes[0].id, "1");
        assert_eq!(graph.nodes[0].block_type, "http");
        assert_eq!(graph.nodes[0].config, json!({"url": "x"}));
        assert!(graph.nodes[0].is_terminal());
    }

    #[test]
    fn resolves_blocks_and_connections() {
        let graph = resolve_graph(
            "wf",
            &json!({
                "blocks": [
                    {"id": "a", "blockType": "webhook"},
                    {"id": "b", "blockType": "mail", "isTerminal": true, "params": {"to": "x"}}
                ],
                "connections": [{"from": "a", "to": "b"}]
            }),
        )
        .unwrap();
        assert_eq!(graph.nodes[1].block_type, "mail");
        assert_eq!(graph.nodes[1].config, json!({"to": "x"}));
        assert_eq!(graph.edges, vec![Edge::new("a", "b")]);
    }

    #[test]
    fn graph_wrapper_shape_wins_over_later_candidates() {
        let graph = resolve_graph(
            "wf",
            &json!({"graph": {"nodes": [{"id": "only", "type": "output", "role": "output"}]}}),
        )
        .unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn unknown_shape_is_unresolvable() {
        let err = resolve_graph("wf-9", &json!({"steps": []})).unwrap_err();
        assert!(matches!(err, DefinitionError::Unresolvable { ref workflow_id } if workflow_id == "wf-9"));
    }

    #[test]
    fn node_without_type_is_malformed() {
        let err = resolve_graph("wf", &json!({"nodes": [{"id": "x"}], "edges": []})).unwrap_err();
        assert!(matches!(err, DefinitionError::Malformed { what: "node", .. }));
    }
}
