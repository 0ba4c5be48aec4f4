/// Workflow Management Layer
///
/// Workflow definitions, their resolution from stored JSON, structural
/// validation, and the hot-reload registry that serves graphs to workers.
///
/// - Type definitions (WorkflowGraph, Node, Edge, Execution)
/// - Legacy definition resolution
/// - Dependency map and graph validation
/// - Lock-free registry using ArcSwap

// Core workflow and execution type definitions
pub mod types;

// Stored definition -> graph normalization
pub mod definition;

// Dependency map, cycle/disconnection/terminal validation
pub mod graph;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use graph::{build_dependency_map, validate, DependencyMap};
pub use registry::{WorkflowRegistry, WorkflowSource};
pub use types::{
    Edge, Execution, ExecutionStatus, Node, NodeExecutionRecord, NodeRole, NodeStatus,
    WorkflowGraph,
};
