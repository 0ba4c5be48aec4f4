/// Built-in block types
///
/// - `webhook` / `manual` / `trigger`: emit the run's trigger payload
/// - `output`: terminal collector
/// - `http`: outbound HTTP request (reqwest)
/// - `script`: sandboxed Lua (mlua)
/// - `delay` / `approval`: flow control

pub mod control;
pub mod http;
pub mod output;
pub mod script;
pub mod trigger;

use crate::runtime::registry::HandlerRegistry;

pub use control::{ApprovalHandler, DelayHandler};
pub use http::HttpHandler;
pub use output::OutputHandler;
pub use script::ScriptHandler;
pub use trigger::TriggerHandler;

/// Register every built-in handler
pub fn register_builtins(registry: &HandlerRegistry) {
    for block_type in ["webhook", "manual", "trigger"] {
        registry.register_simple(block_type, TriggerHandler);
    }
    registry.register_simple("output", OutputHandler);
    registry.register_enhanced("http", HttpHandler);
    registry.register_simple("script", ScriptHandler);
    registry.register_enhanced("delay", DelayHandler);
    registry.register_enhanced("approval", ApprovalHandler);

    tracing::info!("🧩 Registered built-in block types: {:?}", registry.block_types());
}
