//! One specialist agent's step loop: compose a prompt, call the model, run
//! any tool calls it asks for, and decide when the task is done.
//!
//! The loop (compose -> call model -> drive the message builder -> run tools
//! -> check completion -> repeat) mirrors the structure
//! [`LLMSession::send_message`](crate::taskmesh::llm_session::LLMSession::send_message)
//! already uses for a single exchange, generalized to many rounds with native
//! tool calling and windowed history instead of pure token trimming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::taskmesh::config::{AgentSpec, ExecutionParams, PromptTemplate};
use crate::taskmesh::context_strategy::ContextStrategy;
use crate::taskmesh::event::{Event, EventBus, EventPayload};
use crate::taskmesh::message_builder::{Message, MessageBuilder, Role};
use crate::taskmesh::model_provider::{ModelProvider, ModelToolCall};
use crate::taskmesh::plan::{OnFailure, Task};
use crate::taskmesh::project::Project;
use crate::taskmesh::tool_protocol::{ToolContext, ToolRegistry};

/// Default ceiling on wall-clock time for a whole task, across all of its
/// rounds and retry attempts.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Maximum number of attempts for a task whose `onFailure` is `retry`.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Final status of one [`AgentRunner::run_task`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcomeStatus {
    Completed,
    Failed,
}

/// Outcome of running one task to completion (or exhausting its retries).
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskOutcomeStatus,
    pub summary: String,
    pub attempts: u32,
}

/// Runs one specialist agent's step loop against a single [`Task`], calling
/// out to a [`ModelProvider`] for completions and a [`ToolRegistry`] for tool
/// calls, and publishing streamed parts through an [`EventBus`].
pub struct AgentRunner<M: ModelProvider> {
    model: Arc<M>,
    tools: Arc<ToolRegistry>,
    events: Arc<EventBus>,
    context_strategy: Arc<dyn ContextStrategy>,
}

impl<M: ModelProvider> AgentRunner<M> {
    pub fn new(
        model: Arc<M>,
        tools: Arc<ToolRegistry>,
        events: Arc<EventBus>,
        context_strategy: Arc<dyn ContextStrategy>,
    ) -> Self {
        Self {
            model,
            tools,
            events,
            context_strategy,
        }
    }

    /// Run `task` to completion, retrying per `task.on_failure` and bounded
    /// by `execution.max_rounds` rounds per attempt and [`DEFAULT_TASK_TIMEOUT`]
    /// wall-clock time per attempt.
    pub async fn run_task(
        &self,
        project: &Project,
        agent: &AgentSpec,
        task: &Task,
        execution: &ExecutionParams,
        cancelled: Arc<AtomicBool>,
    ) -> TaskResult {
        let max_rounds = execution.max_rounds.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt = tokio::time::timeout(
                DEFAULT_TASK_TIMEOUT,
                self.run_attempt(project, agent, task, execution, max_rounds, cancelled.clone()),
            )
            .await;

            let outcome = match attempt {
                Ok(inner) => inner,
                Err(_) => Err("task timed out before reaching a terminating response".to_string()),
            };

            match outcome {
                Ok(summary) => {
                    return TaskResult {
                        status: TaskOutcomeStatus::Completed,
                        summary,
                        attempts,
                    }
                }
                Err(summary) => {
                    let should_retry = task.on_failure == OnFailure::Retry
                        && attempts < MAX_RETRY_ATTEMPTS
                        && !cancelled.load(Ordering::Relaxed);
                    if should_retry {
                        log::warn!("task {} attempt {} failed, retrying: {}", task.id, attempts, summary);
                        continue;
                    }
                    return TaskResult {
                        status: TaskOutcomeStatus::Failed,
                        summary,
                        attempts,
                    };
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        project: &Project,
        agent: &AgentSpec,
        task: &Task,
        execution: &ExecutionParams,
        max_rounds: u32,
        cancelled: Arc<AtomicBool>,
    ) -> Result<String, String> {
        let system_prompt = render_prompt(agent, task);

        for round in 0..max_rounds {
            if cancelled.load(Ordering::Relaxed) {
                return Err("cancelled".to_string());
            }

            let mut window = {
                let conversation = project.conversation.lock().await;
                self.context_strategy.window(&conversation, Some(&task.id))
            };

            let mut request: Vec<Message> = Vec::with_capacity(window.len() + 2);
            request.push(system_message(&project.id, &task.id, &system_prompt));
            request.append(&mut window);
            if round == 0 {
                request.push(user_goal_message(&project.id, &task.id, &task.goal));
            }

            let tool_schemas = self.allowed_tool_schemas(agent).await;
            let completion = self
                .model
                .complete(&request, &tool_schemas)
                .await
                .map_err(|e| e.to_string())?;

            let (mut builder, start_payload) =
                MessageBuilder::begin(project.id.clone(), Some(task.id.clone()), Role::Assistant);
            self.publish(&project.id, start_payload).await;

            if !completion.text.is_empty() {
                let payloads = builder.append_text(&completion.text);
                self.publish_all(&project.id, payloads).await;
            }
            for tool_call in &completion.tool_calls {
                let payloads =
                    builder.begin_tool_call(tool_call.id.clone(), tool_call.name.clone(), tool_call.arguments.clone());
                self.publish_all(&project.id, payloads).await;
            }

            self.run_tool_calls(project, agent, task, &completion.tool_calls, cancelled.clone(), &mut builder)
                .await;

            let has_pending_tool_calls = !completion.tool_calls.is_empty();
            let sentinel_hit = execution
                .completion_sentinel
                .as_deref()
                .map(|sentinel| completion.text.contains(sentinel))
                .unwrap_or(false);
            let finished_naturally = completion.finish_reason.as_deref() == Some("stop");
            let last_round = round + 1 == max_rounds;

            let (message, finish_payloads) = builder.finish();
            self.publish_all(&project.id, finish_payloads).await;
            project.append_message(message.clone()).await;

            if !has_pending_tool_calls && (sentinel_hit || finished_naturally || last_round) {
                return Ok(message.content);
            }
        }

        Err("max rounds exceeded without a terminating response".to_string())
    }

    /// Schemas for the tools `agent` is allowed to call, filtered down from
    /// the registry's full set by `agent.tools`. An agent with no entries in
    /// `tools` is handed no schemas at all.
    async fn allowed_tool_schemas(&self, agent: &AgentSpec) -> Vec<crate::taskmesh::tool_protocol::ToolSchema> {
        self.tools
            .schemas()
            .await
            .into_iter()
            .filter(|schema| agent.tools.iter().any(|name| name == &schema.name))
            .collect()
    }

    /// Execute every tool call in the round, in parallel if every one of them
    /// is registered `parallelSafe`, sequentially otherwise.
    async fn run_tool_calls(
        &self,
        project: &Project,
        agent: &AgentSpec,
        task: &Task,
        tool_calls: &[ModelToolCall],
        cancelled: Arc<AtomicBool>,
        builder: &mut MessageBuilder,
    ) {
        if tool_calls.is_empty() {
            return;
        }

        let names: Vec<String> = tool_calls.iter().map(|t| t.name.clone()).collect();
        let can_parallelize = tool_calls.len() > 1 && self.tools.all_parallel_safe(&names).await;

        if can_parallelize {
            let results = join_all(
                tool_calls
                    .iter()
                    .map(|tool_call| self.invoke_tool(project, agent, task, tool_call, cancelled.clone())),
            )
            .await;
            for (tool_call, (value, is_error)) in tool_calls.iter().zip(results) {
                let payloads = builder.complete_tool_call(tool_call.id.clone(), value, is_error);
                self.publish_all(&project.id, payloads).await;
            }
        } else {
            for tool_call in tool_calls {
                let (value, is_error) = self.invoke_tool(project, agent, task, tool_call, cancelled.clone()).await;
                let payloads = builder.complete_tool_call(tool_call.id.clone(), value, is_error);
                self.publish_all(&project.id, payloads).await;
            }
        }
    }

    async fn invoke_tool(
        &self,
        project: &Project,
        agent: &AgentSpec,
        task: &Task,
        tool_call: &ModelToolCall,
        cancelled: Arc<AtomicBool>,
    ) -> (serde_json::Value, bool) {
        if !agent.tools.iter().any(|name| name == &tool_call.name) {
            let err = crate::taskmesh::tool_protocol::ToolError::NotFound(tool_call.name.clone());
            log::warn!("agent {} is not allowed to call tool {}: {}", agent.name, tool_call.name, err);
            return (serde_json::Value::String(err.to_string()), true);
        }

        let ctx = ToolContext {
            workspace_root: project.workspace_root.clone(),
            task_id: task.id.clone(),
            cancelled,
        };
        match self.tools.invoke(ctx, &tool_call.name, tool_call.arguments.clone()).await {
            Ok(value) => (value, false),
            Err(err) => {
                log::warn!("tool {} failed for task {}: {}", tool_call.name, task.id, err);
                (serde_json::Value::String(err.to_string()), true)
            }
        }
    }

    async fn publish(&self, project_id: &str, payload: EventPayload) {
        self.events.publish(project_id, Event::new(project_id, payload)).await;
    }

    async fn publish_all(&self, project_id: &str, payloads: Vec<EventPayload>) {
        for payload in payloads {
            self.publish(project_id, payload).await;
        }
    }
}

fn render_prompt(agent: &AgentSpec, task: &Task) -> String {
    let template = match &agent.prompt_template {
        PromptTemplate::Inline(text) => text.clone(),
        PromptTemplate::Path(path) => std::fs::read_to_string(path).unwrap_or_default(),
    };
    format!("{}\n\nCurrent task goal: {}", template, task.goal)
}

fn system_message(project_id: &str, task_id: &str, prompt: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        task_id: Some(task_id.to_string()),
        role: Role::System,
        timestamp: chrono::Utc::now(),
        parts: vec![],
        content: prompt.to_string(),
    }
}

fn user_goal_message(project_id: &str, task_id: &str, goal: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        task_id: Some(task_id.to_string()),
        role: Role::User,
        timestamp: chrono::Utc::now(),
        parts: vec![],
        content: goal.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmesh::config::TeamConfig;
    use crate::taskmesh::model_provider::{ModelCompletion, ModelError};
    use crate::taskmesh::tool_protocol::{ToolError, ToolHandler, ToolParameter, ToolParameterType, ToolSchema};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    /// Scripted model that returns one completion per call, in order,
    /// looping on the last one if called more times than scripted.
    struct ScriptedModel {
        responses: StdMutex<Vec<ModelCompletion>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<ModelCompletion>) -> Self {
            Self {
                responses: StdMutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn complete(&self, _messages: &[Message], _tools: &[ToolSchema]) -> Result<ModelCompletion, ModelError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }

        async fn complete_structured(&self, _messages: &[Message], _schema: &serde_json::Value) -> Result<serde_json::Value, ModelError> {
            unimplemented!("not used by agent_runner tests")
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, _ctx: ToolContext, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(args)
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolHandler for FailingTool {
        async fn call(&self, _ctx: ToolContext, _args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Err(ToolError::ExecutionFailed("boom".to_string()))
        }
    }

    fn test_project() -> Project {
        Project::new("p1", "u1", "goal", TeamConfig::new("team"), PathBuf::from("/tmp/p1"))
    }

    fn test_task() -> Task {
        Task::new("t1", "step one", "write a haiku", "writer")
    }

    #[tokio::test]
    async fn run_task_completes_on_a_plain_text_response() {
        let model = Arc::new(ScriptedModel::new(vec![ModelCompletion {
            text: "Here is your haiku.".to_string(),
            tool_calls: vec![],
            finish_reason: Some("stop".to_string()),
        }]));
        let tools = Arc::new(ToolRegistry::new());
        let events = Arc::new(EventBus::new());
        let context_strategy: Arc<dyn ContextStrategy> = Arc::new(crate::taskmesh::context_strategy::TrimStrategy::default());
        let runner = AgentRunner::new(model, tools, events, context_strategy);

        let project = test_project();
        let agent = AgentSpec::new("writer", "writes haikus").with_prompt("You write haikus.");
        let task = test_task();
        let execution = ExecutionParams::default();

        let result = runner
            .run_task(&project, &agent, &task, &execution, Arc::new(AtomicBool::new(false)))
            .await;

        assert_eq!(result.status, TaskOutcomeStatus::Completed);
        assert_eq!(result.attempts, 1);
        assert!(result.summary.contains("haiku"));
        assert_eq!(project.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn run_task_invokes_tool_calls_then_completes() {
        let tools = Arc::new(ToolRegistry::new());
        tools
            .register_with(
                "echo",
                ToolSchema::new("echo", "echoes input").with_parameter(ToolParameter::new("text", ToolParameterType::String)),
                Arc::new(EchoTool),
                false,
                Duration::from_secs(5),
            )
            .await;

        let model = Arc::new(ScriptedModel::new(vec![
            ModelCompletion {
                text: "Let me check something.".to_string(),
                tool_calls: vec![ModelToolCall {
                    id: "call-1".to_string(),
                    name: "echo".to_string(),
                    arguments: serde_json::json!({"text": "hi"}),
                }],
                finish_reason: None,
            },
            ModelCompletion {
                text: "All done.".to_string(),
                tool_calls: vec![],
                finish_reason: Some("stop".to_string()),
            },
        ]));

        let events = Arc::new(EventBus::new());
        let context_strategy: Arc<dyn ContextStrategy> = Arc::new(crate::taskmesh::context_strategy::TrimStrategy::default());
        let runner = AgentRunner::new(model, tools, events, context_strategy);

        let project = test_project();
        let agent = AgentSpec::new("writer", "writes haikus").with_tool("echo");
        let task = test_task();
        let execution = ExecutionParams::default();

        let result = runner
            .run_task(&project, &agent, &task, &execution, Arc::new(AtomicBool::new(false)))
            .await;

        assert_eq!(result.status, TaskOutcomeStatus::Completed);
        let messages = project.messages().await;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("Tool echo completed"));
    }

    #[tokio::test]
    async fn failing_tool_is_non_fatal_and_recorded_as_an_error_result() {
        let tools = Arc::new(ToolRegistry::new());
        tools
            .register("fail", ToolSchema::new("fail", "always fails"), Arc::new(FailingTool))
            .await;

        let model = Arc::new(ScriptedModel::new(vec![
            ModelCompletion {
                text: String::new(),
                tool_calls: vec![ModelToolCall {
                    id: "call-1".to_string(),
                    name: "fail".to_string(),
                    arguments: serde_json::json!({}),
                }],
                finish_reason: None,
            },
            ModelCompletion {
                text: "Recovered after the failure.".to_string(),
                tool_calls: vec![],
                finish_reason: Some("stop".to_string()),
            },
        ]));

        let events = Arc::new(EventBus::new());
        let context_strategy: Arc<dyn ContextStrategy> = Arc::new(crate::taskmesh::context_strategy::TrimStrategy::default());
        let runner = AgentRunner::new(model, tools, events, context_strategy);

        let project = test_project();
        let agent = AgentSpec::new("writer", "writes haikus").with_tool("fail");
        let task = test_task();
        let execution = ExecutionParams::default();

        let result = runner
            .run_task(&project, &agent, &task, &execution, Arc::new(AtomicBool::new(false)))
            .await;

        assert_eq!(result.status, TaskOutcomeStatus::Completed);
    }

    #[tokio::test]
    async fn agent_without_tool_in_allow_list_cannot_invoke_it() {
        let tools = Arc::new(ToolRegistry::new());
        tools
            .register_with(
                "echo",
                ToolSchema::new("echo", "echoes input").with_parameter(ToolParameter::new("text", ToolParameterType::String)),
                Arc::new(EchoTool),
                false,
                Duration::from_secs(5),
            )
            .await;

        let model = Arc::new(ScriptedModel::new(vec![
            ModelCompletion {
                text: "Let me check something.".to_string(),
                tool_calls: vec![ModelToolCall {
                    id: "call-1".to_string(),
                    name: "echo".to_string(),
                    arguments: serde_json::json!({"text": "hi"}),
                }],
                finish_reason: None,
            },
            ModelCompletion {
                text: "All done.".to_string(),
                tool_calls: vec![],
                finish_reason: Some("stop".to_string()),
            },
        ]));

        let events = Arc::new(EventBus::new());
        let context_strategy: Arc<dyn ContextStrategy> = Arc::new(crate::taskmesh::context_strategy::TrimStrategy::default());
        let runner = AgentRunner::new(model, tools, events, context_strategy);

        let project = test_project();
        // "writer" never lists "echo" among its allowed tools.
        let agent = AgentSpec::new("writer", "writes haikus");
        let task = test_task();
        let execution = ExecutionParams::default();

        let result = runner
            .run_task(&project, &agent, &task, &execution, Arc::new(AtomicBool::new(false)))
            .await;

        assert_eq!(result.status, TaskOutcomeStatus::Completed);
        let messages = project.messages().await;
        assert!(messages[0].content.contains("not found"));
    }

    #[tokio::test]
    async fn run_task_fails_when_cancelled_before_starting() {
        let model = Arc::new(ScriptedModel::new(vec![ModelCompletion {
            text: "unreachable".to_string(),
            tool_calls: vec![],
            finish_reason: Some("stop".to_string()),
        }]));
        let tools = Arc::new(ToolRegistry::new());
        let events = Arc::new(EventBus::new());
        let context_strategy: Arc<dyn ContextStrategy> = Arc::new(crate::taskmesh::context_strategy::TrimStrategy::default());
        let runner = AgentRunner::new(model, tools, events, context_strategy);

        let project = test_project();
        let agent = AgentSpec::new("writer", "writes haikus");
        let task = Task::new("t1", "step one", "goal", "writer").with_on_failure(OnFailure::Continue);
        let execution = ExecutionParams::default();

        let result = runner
            .run_task(&project, &agent, &task, &execution, Arc::new(AtomicBool::new(true)))
            .await;

        assert_eq!(result.status, TaskOutcomeStatus::Failed);
        assert_eq!(result.attempts, 1);
    }
}
