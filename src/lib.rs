// src/lib.rs

// Import the top-level `taskmesh` module.
pub mod taskmesh;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting key items for easier external access.
pub use taskmesh::client_wrapper::{ClientWrapper, Message, Role};
pub use taskmesh::llm_session::LLMSession;
pub use taskmesh::plan::{OnFailure, Plan, Task, TaskStatus};
pub use taskmesh::event::{Event, EventBus};
pub use taskmesh::message_builder::MessageBuilder;
pub use taskmesh::tool_protocol::ToolRegistry;
pub use taskmesh::agent_runner::AgentRunner;
pub use taskmesh::scheduler::Scheduler;
pub use taskmesh::coordinator::XCoordinator;
pub use taskmesh::error::CoreError;
pub use taskmesh::project::{Project, ProjectRegistry};
pub use taskmesh::model_provider::{ClientWrapperProvider, ModelProvider};

// Re-export whole submodules so callers can reach e.g. `taskmesh::clients::openai`
// or `taskmesh::client_wrapper::TokenUsage` without the doubled `taskmesh::taskmesh::` path.
pub use taskmesh::client_wrapper;
pub use taskmesh::clients;
pub use taskmesh::context_strategy;
pub use taskmesh::tools;

/// Initializes the `env_logger` backend for the `log` facade used throughout the crate.
///
/// Safe to call more than once (including concurrently from multiple test binaries); later
/// calls after the first are no-ops.
pub fn init_logger() {
    let _ = env_logger::try_init();
}
