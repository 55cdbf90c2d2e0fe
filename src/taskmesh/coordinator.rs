//! The conversational entry point.
//!
//! `XCoordinator` classifies each incoming chat message, drives plan
//! generation/revision through `ModelProvider::complete_structured`, and
//! advances autonomous execution one `Scheduler::step` at a time, composing a
//! final synthesis message once every task has settled.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::taskmesh::config::TeamConfig;
use crate::taskmesh::context_strategy::ContextStrategy;
use crate::taskmesh::event::{Event, EventBus, EventPayload, Subscription};
use crate::taskmesh::message_builder::{Message, MessageBuilder, Role};
use crate::taskmesh::model_provider::{ModelError, ModelProvider};
use crate::taskmesh::plan::{OnFailure, Plan, PlanError, Task, TaskStatus};
use crate::taskmesh::project::{Artifact, FileStore, FileStoreError, NoopFileStore, Project, ProjectRegistry, ProjectSnapshot, ProjectStatus};
use crate::taskmesh::scheduler::{Progress, Scheduler, SchedulerError};
use crate::taskmesh::agent_runner::AgentRunner;
use crate::taskmesh::tool_protocol::ToolRegistry;

/// Maximum number of re-prompt attempts when a generated plan violates `Plan`'s invariants.
const MAX_PLAN_GENERATION_ATTEMPTS: u32 = 3;

/// Errors raised by an [`XCoordinator`].
#[derive(Debug, Clone)]
pub enum CoordinatorError {
    Model(ModelError),
    Plan(PlanError),
    Scheduler(SchedulerError),
    /// The model never produced an invariant-satisfying plan within the retry budget.
    PlanGenerationFailed(String),
    NoPlan,
    /// No project is registered under the given id.
    ProjectNotFound(String),
    FileStore(FileStoreError),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::Model(e) => write!(f, "{}", e),
            CoordinatorError::Plan(e) => write!(f, "{}", e),
            CoordinatorError::Scheduler(e) => write!(f, "{}", e),
            CoordinatorError::PlanGenerationFailed(msg) => write!(f, "plan generation failed: {}", msg),
            CoordinatorError::NoPlan => write!(f, "project has no plan"),
            CoordinatorError::ProjectNotFound(id) => write!(f, "no project registered with id: {}", id),
            CoordinatorError::FileStore(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<ModelError> for CoordinatorError {
    fn from(e: ModelError) -> Self {
        CoordinatorError::Model(e)
    }
}

impl From<PlanError> for CoordinatorError {
    fn from(e: PlanError) -> Self {
        CoordinatorError::Plan(e)
    }
}

impl From<SchedulerError> for CoordinatorError {
    fn from(e: SchedulerError) -> Self {
        CoordinatorError::Scheduler(e)
    }
}

impl From<FileStoreError> for CoordinatorError {
    fn from(e: FileStoreError) -> Self {
        CoordinatorError::FileStore(e)
    }
}

/// How an incoming chat message was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum InputClass {
    InitialGoal,
    PlanAdjustment,
    Question,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassificationResult {
    class: InputClass,
    #[serde(default)]
    diff: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratedTask {
    id: String,
    name: String,
    goal: String,
    assigned_agent: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    on_failure: Option<OnFailure>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratedPlan {
    goal: String,
    tasks: Vec<GeneratedTask>,
}

/// Result of one [`XCoordinator::chat`] call.
#[derive(Debug, Clone)]
pub struct XResponse {
    pub message: Message,
    pub plan_changed: bool,
}

/// Result of one [`XCoordinator::step`] call.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub progress: Progress,
    pub project_status: ProjectStatus,
}

/// The conversational entry point wrapping a [`Scheduler`] and a [`ModelProvider`].
pub struct XCoordinator<M: ModelProvider> {
    model: Arc<M>,
    scheduler: Arc<Scheduler<M>>,
    events: Arc<EventBus>,
    registry: Arc<ProjectRegistry>,
    file_store: Arc<dyn FileStore>,
}

impl<M: ModelProvider> XCoordinator<M> {
    pub fn new(
        model: Arc<M>,
        tools: Arc<ToolRegistry>,
        events: Arc<EventBus>,
        context_strategy: Arc<dyn ContextStrategy>,
        registry: Arc<ProjectRegistry>,
    ) -> Self {
        Self::with_file_store(model, tools, events, context_strategy, registry, Arc::new(NoopFileStore))
    }

    /// As [`XCoordinator::new`], but with an explicit [`FileStore`] for
    /// `GetArtifacts`/`GetArtifactContent` instead of the no-op default.
    pub fn with_file_store(
        model: Arc<M>,
        tools: Arc<ToolRegistry>,
        events: Arc<EventBus>,
        context_strategy: Arc<dyn ContextStrategy>,
        registry: Arc<ProjectRegistry>,
        file_store: Arc<dyn FileStore>,
    ) -> Self {
        let runner = Arc::new(AgentRunner::new(model.clone(), tools, events.clone(), context_strategy));
        let scheduler = Arc::new(Scheduler::new(runner, events.clone()));
        Self { model, scheduler, events, registry, file_store }
    }

    async fn require_project(&self, project_id: &str) -> Result<Arc<Project>, CoordinatorError> {
        self.registry
            .get(project_id)
            .await
            .ok_or_else(|| CoordinatorError::ProjectNotFound(project_id.to_string()))
    }

    /// Subscribe to a project's event stream. Delegates directly to
    /// [`EventBus::subscribe`]; does not check that the project exists, since
    /// a subscriber may arrive before `start` is called for it.
    pub async fn subscribe(&self, project_id: &str) -> Subscription {
        self.events.subscribe(project_id).await
    }

    /// Fetch an immutable snapshot of a project's current state.
    pub async fn get_project(&self, project_id: &str) -> Result<ProjectSnapshot, CoordinatorError> {
        Ok(self.require_project(project_id).await?.snapshot().await)
    }

    /// Fetch a project's full conversation history.
    pub async fn get_messages(&self, project_id: &str) -> Result<Vec<Message>, CoordinatorError> {
        Ok(self.require_project(project_id).await?.messages().await)
    }

    /// List every artifact stored for a project.
    pub async fn get_artifacts(&self, project_id: &str) -> Result<Vec<Artifact>, CoordinatorError> {
        self.require_project(project_id).await?;
        Ok(self.file_store.list(project_id).await?)
    }

    /// Fetch one artifact's content, optionally at a specific version (the
    /// latest version if `None`).
    pub async fn get_artifact_content(&self, project_id: &str, name: &str, version: Option<u64>) -> Result<Artifact, CoordinatorError> {
        self.require_project(project_id).await?;
        Ok(self.file_store.read(project_id, name, version).await?)
    }

    /// Stop a running project's execution. Matches the `onFailure=abort`
    /// path in `step`: the project settles into `failed` and every running
    /// worker's in-flight model/tool calls are cancelled. Idempotent.
    pub async fn cancel_project(&self, project_id: &str) -> Result<(), CoordinatorError> {
        let project = self.require_project(project_id).await?;
        self.scheduler.cancel();
        project.set_status(ProjectStatus::Failed).await;
        self.publish(project_id, EventPayload::ProjectStatusChanged { status: "failed".to_string() }).await;
        Ok(())
    }

    /// Remove a project from the registry entirely. Does not touch any
    /// artifacts a [`FileStore`] may hold for it.
    pub async fn delete_project(&self, project_id: &str) -> Result<(), CoordinatorError> {
        self.require_project(project_id).await?;
        self.registry.remove(project_id).await;
        Ok(())
    }

    /// Create a project and register it. Does not generate a plan yet; the
    /// first `chat` call triggers plan generation.
    pub async fn start(&self, user_id: impl Into<String>, goal: impl Into<String>, config: TeamConfig, workspace_root: PathBuf) -> Arc<Project> {
        let project = Arc::new(Project::new(
            uuid::Uuid::new_v4().to_string(),
            user_id,
            goal,
            config,
            workspace_root,
        ));
        self.registry.insert(project.clone()).await;
        project
    }

    /// Handle one user chat turn: classify it, act on the classification, and
    /// return the assistant-facing response.
    pub async fn chat(&self, project: &Arc<Project>, message: impl Into<String>) -> Result<XResponse, CoordinatorError> {
        let message = message.into();
        project
            .append_message(Message {
                id: uuid::Uuid::new_v4().to_string(),
                project_id: project.id.clone(),
                task_id: None,
                role: Role::User,
                timestamp: chrono::Utc::now(),
                parts: vec![],
                content: message,
            })
            .await;

        let (class, diff) = self.classify_input(project).await?;

        match class {
            InputClass::InitialGoal => {
                self.generate_plan(project).await?;
                project.set_status(ProjectStatus::Running).await;
                self.publish(&project.id, EventPayload::PlanUpdated { version: self.plan_version(project).await }).await;
                let reply = self.direct_reply(project, "A plan has been generated for this goal.").await?;
                Ok(XResponse { message: reply, plan_changed: true })
            }
            InputClass::PlanAdjustment => {
                let diff = diff.unwrap_or_default();
                self.revise_plan(project, &diff).await?;
                self.publish(&project.id, EventPayload::PlanUpdated { version: self.plan_version(project).await }).await;
                let reply = self.direct_reply(project, "The plan has been revised.").await?;
                Ok(XResponse { message: reply, plan_changed: true })
            }
            InputClass::Question => {
                let reply = self.direct_reply(project, "").await?;
                Ok(XResponse { message: reply, plan_changed: false })
            }
        }
    }

    /// Advance autonomous execution by one scheduler step, finalizing the
    /// project if that step left every task terminal.
    pub async fn step(&self, project: &Arc<Project>) -> Result<StepReport, CoordinatorError> {
        let progress = self.scheduler.step(project).await?;

        if let Progress::TaskFinished { ref task_id, status: TaskStatus::Failed } = progress {
            let aborts = {
                let plan_guard = project.plan.lock().await;
                plan_guard.as_ref().and_then(|p| p.get(task_id)).map(|t| t.on_failure) == Some(OnFailure::Abort)
            };
            if aborts {
                self.scheduler.cancel();
                project.set_status(ProjectStatus::Failed).await;
                self.publish(&project.id, EventPayload::ProjectStatusChanged { status: "failed".to_string() }).await;
                return Ok(StepReport { progress, project_status: ProjectStatus::Failed });
            }
        }

        let plan_complete = {
            let plan_guard = project.plan.lock().await;
            plan_guard.as_ref().map(|p| p.is_complete()).unwrap_or(false)
        };

        if plan_complete && project.status().await == ProjectStatus::Running {
            self.finalize(project).await?;
            project.set_status(ProjectStatus::Completed).await;
            self.publish(&project.id, EventPayload::ProjectStatusChanged { status: "completed".to_string() }).await;
        }

        Ok(StepReport { progress, project_status: project.status().await })
    }

    pub async fn is_complete(&self, project: &Project) -> bool {
        matches!(project.status().await, ProjectStatus::Completed | ProjectStatus::Failed)
    }

    async fn classify_input(&self, project: &Project) -> Result<(InputClass, Option<String>), CoordinatorError> {
        if project.plan.lock().await.is_none() {
            return Ok((InputClass::InitialGoal, None));
        }

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "class": {"type": "string", "enum": ["initialGoal", "planAdjustment", "question"]},
                "diff": {"type": "string"},
            },
            "required": ["class"],
        });
        let messages = project.messages().await;
        let result: ClassificationResult = serde_json::from_value(
            self.model.complete_structured(&messages, &schema).await?,
        )
        .map_err(|e| CoordinatorError::Model(ModelError::OutputInvalid(e.to_string())))?;

        if let (InputClass::PlanAdjustment, Some(diff)) = (result.class, &result.diff) {
            log::info!("plan adjustment requested for project {}: {}", project.id, diff);
        }
        Ok((result.class, result.diff))
    }

    /// Generate an initial plan, re-prompting with the specific invariant
    /// violation up to [`MAX_PLAN_GENERATION_ATTEMPTS`] times.
    async fn generate_plan(&self, project: &Project) -> Result<(), CoordinatorError> {
        let schema = plan_schema(project);
        let mut messages = project.messages().await;
        let mut last_error = String::new();

        for attempt in 0..MAX_PLAN_GENERATION_ATTEMPTS {
            let generated: GeneratedPlan = match self.model.complete_structured(&messages, &schema).await {
                Ok(value) => match serde_json::from_value(value) {
                    Ok(plan) => plan,
                    Err(e) => {
                        last_error = e.to_string();
                        messages.push(retry_message(&last_error));
                        continue;
                    }
                },
                Err(e) => return Err(CoordinatorError::Model(e)),
            };

            let tasks: Vec<Task> = generated.tasks.into_iter().map(to_plan_task).collect();
            match Plan::from_tasks(generated.goal, tasks) {
                Ok(plan) => {
                    *project.plan.lock().await = Some(plan);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!("plan generation attempt {} for project {} rejected: {}", attempt + 1, project.id, last_error);
                    messages.push(retry_message(&last_error));
                }
            }
        }

        Err(CoordinatorError::PlanGenerationFailed(last_error))
    }

    /// Revise the current plan, preserving completed work whose goal text is
    /// unchanged. `Plan::revise` already inherits `status`/`result`/`attempts`
    /// for any task id present in both the old and new plan; the convention
    /// that makes this correct is that the planner only reuses an id when it
    /// means for that task to be preserved, and assigns a fresh id whenever a
    /// task's goal changes.
    async fn revise_plan(&self, project: &Project, diff: &str) -> Result<(), CoordinatorError> {
        let schema = plan_schema(project);
        let mut messages = project.messages().await;
        messages.push(revision_request_message(diff));

        let generated: GeneratedPlan = serde_json::from_value(self.model.complete_structured(&messages, &schema).await?)
            .map_err(|e| CoordinatorError::Model(ModelError::OutputInvalid(e.to_string())))?;
        let candidate_tasks: Vec<Task> = generated.tasks.into_iter().map(to_plan_task).collect();

        let (preserved, regenerated) = {
            let plan_guard = project.plan.lock().await;
            let old_plan = plan_guard.as_ref().ok_or(CoordinatorError::NoPlan)?;
            partition_preservation(old_plan, &candidate_tasks)
        };

        let mut plan_guard = project.plan.lock().await;
        let plan = plan_guard.as_mut().ok_or(CoordinatorError::NoPlan)?;
        plan.revise(candidate_tasks)?;
        log::info!(
            "project {} plan revised to version {}: preserved {:?}, regenerated {:?}",
            project.id,
            plan.version,
            preserved,
            regenerated
        );
        Ok(())
    }

    /// One additional agent turn, synthesizing the conversation and collected
    /// task results into a user-facing summary.
    async fn finalize(&self, project: &Project) -> Result<Message, CoordinatorError> {
        let summary_of_results = {
            let plan_guard = project.plan.lock().await;
            plan_guard
                .as_ref()
                .map(|p| {
                    p.tasks()
                        .map(|t| format!("- {} ({:?}): {}", t.name, t.status, t.result.as_deref().unwrap_or("")))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default()
        };

        let mut request = project.messages().await;
        request.push(instruction_message(&format!(
            "Every task has finished. Summarize the outcome for the user based on these task results:\n{}",
            summary_of_results
        )));

        let completion = self.model.complete(&request, &[]).await?;
        let (mut builder, start_payload) = MessageBuilder::begin(project.id.clone(), None, Role::Assistant);
        self.publish(&project.id, start_payload).await;
        let payloads = builder.append_text(&completion.text);
        self.publish_all(&project.id, payloads).await;
        let (finished, finish_payloads) = builder.finish();
        self.publish_all(&project.id, finish_payloads).await;
        project.append_message(finished.clone()).await;
        Ok(finished)
    }

    async fn direct_reply(&self, project: &Project, hint: &str) -> Result<Message, CoordinatorError> {
        let mut request = project.messages().await;
        if !hint.is_empty() {
            request.push(instruction_message(hint));
        }
        let completion = self.model.complete(&request, &[]).await?;

        let (mut builder, start_payload) = MessageBuilder::begin(project.id.clone(), None, Role::Assistant);
        self.publish(&project.id, start_payload).await;
        let payloads = builder.append_text(&completion.text);
        self.publish_all(&project.id, payloads).await;
        let (finished, finish_payloads) = builder.finish();
        self.publish_all(&project.id, finish_payloads).await;
        project.append_message(finished.clone()).await;
        Ok(finished)
    }

    async fn plan_version(&self, project: &Project) -> u64 {
        project.plan.lock().await.as_ref().map(|p| p.version).unwrap_or(0)
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

fn to_plan_task(generated: GeneratedTask) -> Task {
    let mut task = Task::new(generated.id, generated.name, generated.goal, generated.assigned_agent)
        .with_dependencies(generated.dependencies);
    if let Some(on_failure) = generated.on_failure {
        task = task.with_on_failure(on_failure);
    }
    task
}

fn plan_schema(project: &Project) -> serde_json::Value {
    let agent_names: Vec<String> = project.config.agents.iter().map(|a| a.name.clone()).collect();
    serde_json::json!({
        "type": "object",
        "properties": {
            "goal": {"type": "string"},
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "name": {"type": "string"},
                        "goal": {"type": "string"},
                        "assignedAgent": {"type": "string", "enum": agent_names},
                        "dependencies": {"type": "array", "items": {"type": "string"}},
                    },
                    "required": ["id", "name", "goal", "assignedAgent"],
                },
            },
        },
        "required": ["goal", "tasks"],
    })
}

fn normalize_goal(goal: &str) -> String {
    goal.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ids preserved (completed in the old plan, goal unchanged) vs. regenerated,
/// purely for logging/observability — `Plan::revise` itself merges by id
/// regardless of this distinction.
fn partition_preservation(old_plan: &Plan, candidate_tasks: &[Task]) -> (Vec<String>, Vec<String>) {
    let mut preserved = Vec::new();
    let mut regenerated = Vec::new();
    for candidate in candidate_tasks {
        let is_preserved = old_plan
            .get(&candidate.id)
            .map(|old| old.status == TaskStatus::Completed && normalize_goal(&old.goal) == normalize_goal(&candidate.goal))
            .unwrap_or(false);
        if is_preserved {
            preserved.push(candidate.id.clone());
        } else {
            regenerated.push(candidate.id.clone());
        }
    }
    (preserved, regenerated)
}

fn instruction_message(text: &str) -> Message {
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        project_id: String::new(),
        task_id: None,
        role: Role::User,
        timestamp: chrono::Utc::now(),
        parts: vec![],
        content: text.to_string(),
    }
}

fn retry_message(error: &str) -> Message {
    instruction_message(&format!(
        "The previous plan was rejected: {}. Produce a corrected plan matching the schema and satisfying the stated constraint.",
        error
    ))
}

fn revision_request_message(diff: &str) -> Message {
    instruction_message(&format!(
        "Revise the current plan to account for: {}. Keep task ids unchanged for any task you intend to leave exactly as-is; assign a fresh id to any task whose goal changes.",
        diff
    ))
}
