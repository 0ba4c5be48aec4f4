/// Dependency graph builder and structural validator
///
/// Turns node/edge lists into a dependency map and rejects graphs the
/// scheduler cannot run: cycles, disconnected nodes, and workflows without
/// an explicit terminal node.

use crate::error::GraphError;
use crate::workflow::types::WorkflowGraph;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

/// node id -> direct upstream node ids, in edge declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyMap {
    deps: HashMap<String, Vec<String>>,
}

impl DependencyMap {
    /// Direct dependencies of a node. Unknown ids have none.
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.deps.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.deps.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

/// Build the dependency map. Every node gets an entry, empty when nothing
/// targets it. Repeated edges contribute a dependency once.
pub fn build_dependency_map(graph: &WorkflowGraph) -> DependencyMap {
    let mut deps: HashMap<String, Vec<String>> = graph
        .nodes
        .iter()
        .map(|node| (node.id.clone(), Vec::new()))
        .collect();

    for edge in &graph.edges {
        let entry = deps.entry(edge.target.clone()).or_default();
        if !entry.contains(&edge.source) {
            entry.push(edge.source.clone());
        }
    }

    DependencyMap { deps }
}

/// Validate a workflow graph.
///
/// Checks, in order: referential integrity, cycles (three-color DFS),
/// disconnected nodes, and the presence of a terminal-marked node.
pub fn validate(graph: &WorkflowGraph) -> Result<(), GraphError> {
    let mut known = HashSet::new();
    for node in &graph.nodes {
        if !known.insert(node.id.as_str()) {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
    }
    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !known.contains(endpoint.as_str()) {
                return Err(GraphError::UnknownNode(endpoint.clone()));
            }
        }
    }

    if let Some(path) = find_cycle(graph) {
        return Err(GraphError::Cycle { path });
    }

    let connected: HashSet<&str> = graph
        .edges
        .iter()
        .flat_map(|edge| [edge.source.as_str(), edge.target.as_str()])
        .collect();
    let orphaned: Vec<String> = graph
        .nodes
        .iter()
        .filter(|node| !connected.contains(node.id.as_str()))
        .map(|node| node.id.clone())
        .collect();
    if !orphaned.is_empty() {
        return Err(GraphError::Disconnected { nodes: orphaned });
    }

    // Structural sinks do not count; the marker has to be explicit.
    if !graph.nodes.iter().any(|node| node.is_terminal()) {
        return Err(GraphError::MissingTerminal);
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Returns the node path of the first back-edge found, closing the loop
/// (e.g. `1 -> 2 -> 3 -> 1`).
fn find_cycle(graph: &WorkflowGraph) -> Option<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut colors: HashMap<&str, Color> = graph
        .nodes
        .iter()
        .map(|node| (node.id.as_str(), Color::White))
        .collect();

    for node in &graph.nodes {
        if colors.get(node.id.as_str()) != Some(&Color::White) {
            continue;
        }

        // Iterative DFS: (node, next child index)
        let mut stack: Vec<(&str, usize)> = vec![(node.id.as_str(), 0)];
        colors.insert(node.id.as_str(), Color::Gray);

        while let Some((current, child_idx)) = stack.last().copied() {
            let children = adjacency.get(current).map(Vec::as_slice).unwrap_or(&[]);
            if child_idx >= children.len() {
                colors.insert(current, Color::Black);
                stack.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let child = children[child_idx];
            match colors.get(child).copied().unwrap_or(Color::White) {
                Color::White => {
                    colors.insert(child, Color::Gray);
                    stack.push((child, 0));
                }
                Color::Gray => {
                    let start = stack.iter().position(|(id, _)| *id == child).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|(id, _)| id.to_string()).collect();
                    path.push(child.to_string());
                    return Some(path);
                }
                Color::Black => {}
            }
        }
    }

    None
}

/// Petgraph view of a workflow used for reachability queries
#[derive(Debug)]
pub struct GraphIndex {
    graph: DiGraph<String, ()>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl GraphIndex {
    /// Build the index. Edges with unknown endpoints are skipped; callers
    /// validate first.
    pub fn new(workflow: &WorkflowGraph) -> Self {
        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &workflow.nodes {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }
        for edge in &workflow.edges {
            if let (Some(from), Some(to)) = (
                node_id_to_index.get(&edge.source),
                node_id_to_index.get(&edge.target),
            ) {
                graph.add_edge(*from, *to, ());
            }
        }

        Self {
            graph,
            node_id_to_index,
        }
    }

    /// The start node plus everything reachable downstream of it
    pub fn descendants_inclusive(&self, start: &str) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let Some(start_index) = self.node_id_to_index.get(start) else {
            return reachable;
        };

        let mut bfs = Bfs::new(&self.graph, *start_index);
        while let Some(index) = bfs.next(&self.graph) {
            reachable.insert(self.graph[index].clone());
        }
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Edge, Node};
    use serde_json::json;

    fn node(id: &str) -> Node {
        Node::new(id, "noop", json!({}))
    }

    #[test]
    fn dependency_map_is_total() {
        let graph = WorkflowGraph::new(
            vec![node("a"), node("b"), node("c").terminal()],
            vec![Edge::new("a", "c"), Edge::new("b", "c"), Edge::new("a", "c")],
        );
        let deps = build_dependency_map(&graph);
        assert_eq!(deps.len(), 3);
        assert!(deps.dependencies("a").is_empty());
        assert!(deps.dependencies("b").is_empty());
        assert_eq!(deps.dependencies("c"), ["a".to_string(), "b".to_string()]);
        assert!(deps.dependencies("missing").is_empty());
        assert_eq!(deps, build_dependency_map(&graph));
    }

    #[test]
    fn cycle_is_rejected_first() {
        let graph = WorkflowGraph::new(
            vec![node("1"), node("2"), node("3").terminal()],
            vec![Edge::new("1", "2"), Edge::new("2", "3"), Edge::new("3", "1")],
        );
        match validate(&graph) {
            Err(GraphError::Cycle { path }) => assert_eq!(path, vec!["1", "2", "3", "1"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = WorkflowGraph::new(
            vec![node("a").terminal()],
            vec![Edge::new("a", "a")],
        );
        assert!(matches!(validate(&graph), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn isolated_node_is_cited() {
        let graph = WorkflowGraph::new(
            vec![node("1"), node("2"), node("3").terminal(), node("4")],
            vec![Edge::new("1", "2"), Edge::new("2", "3")],
        );
        assert_eq!(
            validate(&graph),
            Err(GraphError::Disconnected {
                nodes: vec!["4".to_string()]
            })
        );
    }

    #[test]
    fn structural_sink_is_not_a_terminal() {
        let graph = WorkflowGraph::new(
            vec![
                Node::new("1", "webhook", json!({})).trigger(),
                Node::new("2", "mail", json!({})),
            ],
            vec![Edge::new("1", "2")],
        );
        let err = validate(&graph).unwrap_err();
        assert_eq!(err, GraphError::MissingTerminal);
        assert!(err.to_string().contains("terminal"));
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let graph = WorkflowGraph::new(
            vec![node("a").terminal()],
            vec![Edge::new("a", "ghost")],
        );
        assert_eq!(validate(&graph), Err(GraphError::UnknownNode("ghost".into())));
    }

    #[test]
    fn diamond_is_valid_and_descendants_follow_edges() {
        let graph = WorkflowGraph::new(
            vec![node("a"), node("b"), node("c"), node("d").terminal()],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );
        assert!(validate(&graph).is_ok());

        let index = GraphIndex::new(&graph);
        let from_b = index.descendants_inclusive("b");
        assert_eq!(from_b.len(), 2);
        assert!(from_b.contains("b") && from_b.contains("d"));
        assert!(index.descendants_inclusive("nope").is_empty());
    }
}
