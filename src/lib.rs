/// flowrelay: queue-backed workflow execution engine
///
/// Runs user-authored workflow DAGs delivered through durable queues, with
/// bounded retries, dead-lettering, pause/resume and a circuit breaker.

// Core configuration and setup
pub mod config;

// Error taxonomy shared across layers
pub mod error;

// Workflow definitions, graph validation and the workflow registry
pub mod workflow;

// Persistence of definitions, executions, profiles and logs
pub mod store;

// Node dispatch and run scheduling
pub mod runtime;

// Durable MAIN / RETRY / DLQ queues
pub mod broker;

// Queue consumer, retry routing and circuit breaker
pub mod worker;

// User notifications
pub mod notify;

// Process wiring
pub mod server;

// Re-export commonly used types for external consumers
pub use broker::{MessageBroker, QueueMessage};
pub use runtime::{HandlerRegistry, RunReport, WorkflowExecutor};
pub use server::{create_app, start_worker};
pub use worker::ExecutionWorker;
pub use workflow::{Edge, ExecutionStatus, Node, WorkflowGraph};
