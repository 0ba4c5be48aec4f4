/// Runtime execution engine
///
/// - `handler`: handler shapes and the per-node context
/// - `registry`: block type to handler lookup
/// - `executor`: single-node dispatch under a timeout
/// - `engine`: run-level scheduling, pause/resume and cleanup
/// - `handlers`: built-in block types

pub mod engine;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod registry;

pub use engine::{ResumePoint, RunReport, RunRequest, WorkflowExecutor};
pub use executor::{get_relevant_outputs, NodeExecutor};
pub use handler::{EnhancedHandler, Handler, NodeContext, NodeOutcome, RunContext, SimpleHandler};
pub use registry::HandlerRegistry;
