//! Tool registration and invocation.
//!
//! A [`ToolRegistry`] maps a tool name to a schema describing its arguments and an
//! async handler that executes it. `invoke` validates the caller's arguments
//! against the schema before the handler ever runs, and enforces a per-tool
//! timeout around the call.
//!
//! ```rust,no_run
//! use taskmesh::tool_protocol::{ToolContext, ToolHandler, ToolRegistry, ToolParameter, ToolParameterType, ToolSchema};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ToolHandler for Echo {
//!     async fn call(&self, _ctx: ToolContext, args: serde_json::Value) -> Result<serde_json::Value, taskmesh::tool_protocol::ToolError> {
//!         Ok(args)
//!     }
//! }
//!
//! # async {
//! let mut registry = ToolRegistry::new();
//! registry.register(
//!     "echo",
//!     ToolSchema::new("echo", "Echo back the input")
//!         .with_parameter(ToolParameter::new("text", ToolParameterType::String).required()),
//!     Arc::new(Echo),
//! );
//! # };
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::taskmesh::plan::TaskId;

/// Default per-tool invocation timeout when a tool doesn't override it.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised while registering or invoking tools.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// No tool is registered under the requested name.
    NotFound(String),
    /// The supplied arguments failed schema validation.
    InvalidArguments(String),
    /// The handler ran and reported an application-level failure.
    ExecutionFailed(String),
    /// The handler did not complete within its timeout.
    ToolTimeout(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
            ToolError::ToolTimeout(name) => write!(f, "tool timed out: {}", name),
        }
    }
}

impl std::error::Error for ToolError {}

/// The type of a single tool parameter, as described in a [`ToolSchema`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// Describes a single named argument accepted by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Argument schema and descriptive metadata for a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Validate `args` against this schema: every required parameter must be
    /// present, and present values must match the declared JSON type.
    fn validate(&self, args: &serde_json::Value) -> Result<(), ToolError> {
        let obj = args.as_object().ok_or_else(|| {
            ToolError::InvalidArguments(format!(
                "{}: arguments must be a JSON object",
                self.name
            ))
        })?;

        for param in &self.parameters {
            match obj.get(&param.name) {
                Some(value) => {
                    if !matches_type(value, &param.param_type) {
                        return Err(ToolError::InvalidArguments(format!(
                            "{}: parameter '{}' must be of type {:?}",
                            self.name, param.name, param.param_type
                        )));
                    }
                }
                None if param.required && param.default.is_none() => {
                    return Err(ToolError::InvalidArguments(format!(
                        "{}: missing required parameter '{}'",
                        self.name, param.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn matches_type(value: &serde_json::Value, ty: &ToolParameterType) -> bool {
    match ty {
        ToolParameterType::String => value.is_string(),
        ToolParameterType::Number => value.is_number(),
        ToolParameterType::Integer => value.is_i64() || value.is_u64(),
        ToolParameterType::Boolean => value.is_boolean(),
        ToolParameterType::Array => value.is_array(),
        ToolParameterType::Object => value.is_object(),
    }
}

/// Per-invocation context passed to a tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Filesystem root the tool may read/write within.
    pub workspace_root: std::path::PathBuf,
    /// The task this invocation is executing on behalf of.
    pub task_id: TaskId,
    /// Set when the surrounding run has been cancelled; long-running
    /// handlers should poll this and return early.
    pub cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl ToolContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Executes a single tool invocation given validated arguments.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        ctx: ToolContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}

struct RegisteredTool {
    schema: ToolSchema,
    handler: Arc<dyn ToolHandler>,
    parallel_safe: bool,
    timeout: Duration,
}

/// Registry of tools invocable by an [`AgentRunner`](crate::taskmesh::agent_runner::AgentRunner).
///
/// Read-mostly: tools are registered once at startup and invoked concurrently
/// afterwards. Reads take a shared lock; registration takes an exclusive one.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with this crate's built-in tools (`bash`,
    /// `filesystem`), registered under those names at their default
    /// unrestricted configuration. A host process that wants a narrower or
    /// differently-configured tool set should start from [`ToolRegistry::new`]
    /// and register its own handlers instead.
    pub async fn with_builtin_tools() -> Self {
        let registry = Self::new();
        registry
            .register(
                "bash",
                crate::taskmesh::tools::BashTool::tool_schema(),
                Arc::new(crate::taskmesh::tools::BashTool::default()),
            )
            .await;
        registry
            .register(
                "filesystem",
                crate::taskmesh::tools::FileSystemTool::tool_schema(),
                Arc::new(crate::taskmesh::tools::FileSystemTool::default()),
            )
            .await;
        registry
    }

    /// Register a tool, replacing any prior binding under the same name.
    pub async fn register(&self, name: impl Into<String>, schema: ToolSchema, handler: Arc<dyn ToolHandler>) {
        self.register_with(name, schema, handler, false, DEFAULT_TOOL_TIMEOUT)
            .await
    }

    /// Register a tool explicitly marking whether it is safe to run concurrently
    /// with other tool calls in the same round, and overriding its timeout.
    pub async fn register_with(
        &self,
        name: impl Into<String>,
        schema: ToolSchema,
        handler: Arc<dyn ToolHandler>,
        parallel_safe: bool,
        timeout: Duration,
    ) {
        let name = name.into();
        self.tools.write().await.insert(
            name,
            RegisteredTool {
                schema,
                handler,
                parallel_safe,
                timeout,
            },
        );
    }

    /// Remove a tool registration, returning whether one was present.
    pub async fn unregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    /// Whether every tool in `names` is marked `parallelSafe`. An unknown name
    /// is treated as not parallel-safe so the caller falls back to sequential
    /// execution rather than skipping the tool.
    pub async fn all_parallel_safe(&self, names: &[String]) -> bool {
        let tools = self.tools.read().await;
        names.iter().all(|n| tools.get(n).is_some_and(|t| t.parallel_safe))
    }

    /// Schemas for every registered tool, in the shape a `ModelProvider` needs
    /// to advertise available functions.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.read().await.values().map(|t| t.schema.clone()).collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Validate `args` against the registered schema and invoke the handler,
    /// enforcing the tool's timeout.
    pub async fn invoke(
        &self,
        ctx: ToolContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let (handler, timeout) = {
            let tools = self.tools.read().await;
            let tool = tools
                .get(name)
                .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
            tool.schema.validate(&args)?;
            (tool.handler.clone(), tool.timeout)
        };

        match tokio::time::timeout(timeout, handler.call(ctx, args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::ToolTimeout(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, _ctx: ToolContext, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(args)
        }
    }

    struct Sleepy;

    #[async_trait]
    impl ToolHandler for Sleepy {
        async fn call(&self, _ctx: ToolContext, _args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            workspace_root: std::path::PathBuf::from("/tmp"),
            task_id: TaskId::from("t1"),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn register_and_invoke_roundtrips_arguments() {
        let registry = ToolRegistry::new();
        registry
            .register(
                "echo",
                ToolSchema::new("echo", "echoes input").with_parameter(
                    ToolParameter::new("text", ToolParameterType::String).required(),
                ),
                Arc::new(Echo),
            )
            .await;

        let result = registry
            .invoke(ctx(), "echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn invoke_unknown_tool_fails() {
        let registry = ToolRegistry::new();
        let err = registry.invoke(ctx(), "nope", serde_json::json!({})).await;
        assert!(matches!(err, Err(ToolError::NotFound(_))));
    }

    #[tokio::test]
    async fn invoke_rejects_missing_required_argument() {
        let registry = ToolRegistry::new();
        registry
            .register(
                "echo",
                ToolSchema::new("echo", "echoes input").with_parameter(
                    ToolParameter::new("text", ToolParameterType::String).required(),
                ),
                Arc::new(Echo),
            )
            .await;

        let err = registry.invoke(ctx(), "echo", serde_json::json!({})).await;
        assert!(matches!(err, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn invoke_rejects_wrong_argument_type() {
        let registry = ToolRegistry::new();
        registry
            .register(
                "echo",
                ToolSchema::new("echo", "echoes input").with_parameter(
                    ToolParameter::new("count", ToolParameterType::Integer).required(),
                ),
                Arc::new(Echo),
            )
            .await;

        let err = registry
            .invoke(ctx(), "echo", serde_json::json!({"count": "not a number"}))
            .await;
        assert!(matches!(err, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn re_registration_replaces_prior_binding() {
        let registry = ToolRegistry::new();
        registry
            .register("echo", ToolSchema::new("echo", "v1"), Arc::new(Echo))
            .await;
        registry
            .register("echo", ToolSchema::new("echo", "v2"), Arc::new(Echo))
            .await;

        let schemas = registry.schemas().await;
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].description, "v2");
    }

    #[tokio::test]
    async fn invoke_times_out_slow_handlers() {
        let registry = ToolRegistry::new();
        registry
            .register_with(
                "slow",
                ToolSchema::new("slow", "never finishes"),
                Arc::new(Sleepy),
                false,
                Duration::from_millis(20),
            )
            .await;

        let err = registry.invoke(ctx(), "slow", serde_json::json!({})).await;
        assert!(matches!(err, Err(ToolError::ToolTimeout(_))));
    }

    #[tokio::test]
    async fn with_builtin_tools_registers_bash_and_filesystem() {
        let registry = ToolRegistry::with_builtin_tools().await;
        assert!(registry.contains("bash").await);
        assert!(registry.contains("filesystem").await);
    }

    #[tokio::test]
    async fn all_parallel_safe_is_false_for_unknown_tools() {
        let registry = ToolRegistry::new();
        registry
            .register_with(
                "safe",
                ToolSchema::new("safe", "parallel-safe"),
                Arc::new(Echo),
                true,
                DEFAULT_TOOL_TIMEOUT,
            )
            .await;

        assert!(registry.all_parallel_safe(&["safe".to_string()]).await);
        assert!(
            !registry
                .all_parallel_safe(&["safe".to_string(), "missing".to_string()])
                .await
        );
    }
}
