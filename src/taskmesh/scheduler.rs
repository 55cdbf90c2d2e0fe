//! Dispatches ready tasks from a project's plan onto bounded-parallel agent
//! workers and integrates each worker's result back into the plan.
//!
//! Worker completions are collected over an internal `mpsc` channel owned by
//! the `Scheduler` itself, not the public [`EventBus`]: subscribing to the bus
//! per `step` call would race with a worker that finishes (and publishes)
//! before the new subscription exists. The channel persists across calls, so
//! a completion sent while nobody was "awaiting" it is simply buffered.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::taskmesh::agent_runner::{AgentRunner, TaskOutcomeStatus};
use crate::taskmesh::event::{Event, EventBus, EventPayload};
use crate::taskmesh::model_provider::ModelProvider;
use crate::taskmesh::plan::{OnFailure, PlanError, TaskId, TaskStatus};
use crate::taskmesh::project::Project;

/// One scheduling step's observable outcome.
#[derive(Debug, Clone)]
pub enum Progress {
    /// A dispatched task reached a terminal status.
    TaskFinished { task_id: TaskId, status: TaskStatus },
    /// Nothing was ready and nothing was in flight: the plan is fully terminal.
    Done,
}

/// How `execute_plan` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    AllTerminal,
    Aborted { task_id: TaskId },
}

/// Errors raised by the [`Scheduler`].
#[derive(Debug, Clone)]
pub enum SchedulerError {
    Plan(PlanError),
    /// `step`/`execute_plan` was called on a project with no plan yet.
    NoPlan,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Plan(e) => write!(f, "{}", e),
            SchedulerError::NoPlan => write!(f, "project has no plan to schedule"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<PlanError> for SchedulerError {
    fn from(e: PlanError) -> Self {
        SchedulerError::Plan(e)
    }
}

struct WorkerResult {
    task_id: TaskId,
    status: TaskStatus,
    summary: String,
}

/// Selects ready tasks, dispatches up to `maxConcurrent` of them as workers,
/// and integrates worker results back into the plan one at a time.
///
/// At most one `Scheduler::step`/`execute_plan` call should be in flight per
/// project at once; the plan's own mutex doesn't by itself prevent two
/// concurrent schedulers from double-dispatching the same ready task.
pub struct Scheduler<M: ModelProvider> {
    runner: Arc<AgentRunner<M>>,
    events: Arc<EventBus>,
    cancelled: Arc<AtomicBool>,
    results_tx: mpsc::UnboundedSender<WorkerResult>,
    results_rx: Mutex<mpsc::UnboundedReceiver<WorkerResult>>,
}

impl<M: ModelProvider> Scheduler<M> {
    pub fn new(runner: Arc<AgentRunner<M>>, events: Arc<EventBus>) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            runner,
            events,
            cancelled: Arc::new(AtomicBool::new(false)),
            results_tx,
            results_rx: Mutex::new(results_rx),
        }
    }

    /// Request cancellation of all current and future dispatches for this
    /// scheduler's project. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// One scheduling step: propagate failures down to dependents that can
    /// never become ready, dispatch as many ready tasks as there are free
    /// concurrency slots, then wait for exactly one dispatched/in-flight
    /// worker to finish and fold its result into the plan.
    pub async fn step(&self, project: &Arc<Project>) -> Result<Progress, SchedulerError> {
        self.fail_tasks_with_failed_dependencies(project).await?;

        let max_concurrent = project.config.execution.max_concurrent;
        let (mut ready, running_count) = {
            let plan_guard = project.plan.lock().await;
            let plan = plan_guard.as_ref().ok_or(SchedulerError::NoPlan)?;
            let ready: Vec<_> = plan.ready_tasks().into_iter().cloned().collect();
            let running_count = plan.tasks().filter(|t| t.status == TaskStatus::Running).count();
            (ready, running_count)
        };

        if ready.is_empty() && running_count == 0 {
            return Ok(Progress::Done);
        }

        // Fewer dependencies first, then lexicographic id, as the tie-break.
        ready.sort_by(|a, b| a.dependencies.len().cmp(&b.dependencies.len()).then_with(|| a.id.cmp(&b.id)));

        let slots = max_concurrent.saturating_sub(running_count);
        let dispatched = !self.cancelled.load(Ordering::Relaxed) && slots > 0 && !ready.is_empty();

        if dispatched {
            for task in ready.into_iter().take(slots) {
                self.dispatch(project, task).await?;
            }
        }

        if !dispatched && running_count == 0 {
            return Ok(Progress::Done);
        }

        match self.results_rx.lock().await.recv().await {
            Some(result) => {
                let mut plan_guard = project.plan.lock().await;
                if let Some(plan) = plan_guard.as_mut() {
                    plan.set_status(&result.task_id, result.status)?;
                    plan.set_result(&result.task_id, result.summary)?;
                }
                drop(plan_guard);

                self.publish(&project.id, EventPayload::TaskStatusChanged {
                    task_id: result.task_id.clone(),
                    status: result.status,
                })
                .await;

                Ok(Progress::TaskFinished { task_id: result.task_id, status: result.status })
            }
            None => Ok(Progress::Done),
        }
    }

    /// Run `step` until every task is terminal, or a task whose `onFailure`
    /// is `abort` fails — in which case remaining running workers are
    /// cancelled and the plan stops accepting new dispatches.
    pub async fn execute_plan(&self, project: &Arc<Project>) -> Result<Completion, SchedulerError> {
        loop {
            match self.step(project).await? {
                Progress::Done => {
                    let all_terminal = {
                        let plan_guard = project.plan.lock().await;
                        plan_guard.as_ref().map(|p| p.is_complete()).unwrap_or(true)
                    };
                    if all_terminal {
                        return Ok(Completion::AllTerminal);
                    }
                }
                Progress::TaskFinished { task_id, status } => {
                    if status == TaskStatus::Failed {
                        let on_failure = {
                            let plan_guard = project.plan.lock().await;
                            plan_guard.as_ref().and_then(|p| p.get(&task_id)).map(|t| t.on_failure)
                        };
                        if on_failure == Some(OnFailure::Abort) {
                            self.cancel();
                            return Ok(Completion::Aborted { task_id });
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, project: &Arc<Project>, task: crate::taskmesh::plan::Task) -> Result<(), SchedulerError> {
        {
            let mut plan_guard = project.plan.lock().await;
            if let Some(plan) = plan_guard.as_mut() {
                plan.set_status(&task.id, TaskStatus::Running)?;
            }
        }
        self.publish(&project.id, EventPayload::TaskStatusChanged {
            task_id: task.id.clone(),
            status: TaskStatus::Running,
        })
        .await;

        let agent = project.config.agent(&task.assigned_agent).cloned();
        let runner = self.runner.clone();
        let project = project.clone();
        let execution = project.config.execution.clone();
        let cancelled = self.cancelled.clone();
        let results_tx = self.results_tx.clone();

        tokio::spawn(async move {
            let (status, summary) = match agent {
                Some(agent) => {
                    let result = runner.run_task(&project, &agent, &task, &execution, cancelled).await;
                    let status = match result.status {
                        TaskOutcomeStatus::Completed => TaskStatus::Completed,
                        TaskOutcomeStatus::Failed => TaskStatus::Failed,
                    };
                    (status, result.summary)
                }
                None => (
                    TaskStatus::Failed,
                    format!("no agent configured named '{}'", task.assigned_agent),
                ),
            };

            let _ = results_tx.send(WorkerResult {
                task_id: task.id,
                status,
                summary,
            });
        });

        Ok(())
    }

    /// Tasks still `pending` whose dependencies include a `failed` task can
    /// never become ready; mark them `failed` without ever dispatching them,
    /// cascading until no more such tasks remain.
    async fn fail_tasks_with_failed_dependencies(&self, project: &Arc<Project>) -> Result<(), SchedulerError> {
        loop {
            let mut newly_failed = Vec::new();
            {
                let mut plan_guard = project.plan.lock().await;
                let plan = match plan_guard.as_mut() {
                    Some(plan) => plan,
                    None => return Ok(()),
                };

                let blocked: Vec<TaskId> = plan
                    .tasks()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .filter(|t| {
                        t.dependencies
                            .iter()
                            .any(|dep| plan.get(dep).map(|d| d.status == TaskStatus::Failed).unwrap_or(false))
                    })
                    .map(|t| t.id.clone())
                    .collect();

                for id in blocked {
                    plan.set_status(&id, TaskStatus::Failed)?;
                    plan.set_result(&id, "dependency failed")?;
                    newly_failed.push(id);
                }
            }

            if newly_failed.is_empty() {
                return Ok(());
            }

            for task_id in newly_failed {
                self.publish(&project.id, EventPayload::TaskStatusChanged {
                    task_id,
                    status: TaskStatus::Failed,
                })
                .await;
            }
        }
    }

    async fn publish(&self, project_id: &str, payload: EventPayload) {
        self.events.publish(project_id, Event::new(project_id, payload)).await;
    }
}
