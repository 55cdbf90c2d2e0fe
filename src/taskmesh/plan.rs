//! The plan data model: a DAG of tasks addressing a user goal.
//!
//! A [`Plan`] owns its [`Task`] set and enforces the invariants that make the
//! graph safe to schedule: no dangling dependency edges, no cycles, and
//! monotone status transitions. Mutation goes through `add_task`,
//! `set_status`, and `revise` rather than direct field access so those
//! invariants can't be bypassed.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Opaque task identifier, stable and unique within a single plan.
pub type TaskId = String;

/// Status of a task or project, monotone along `pending -> running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What the scheduler should do when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Propagate failure to the whole plan.
    Abort,
    /// Leave the plan running; downstream tasks depending on this one never become ready.
    Continue,
    /// Re-enter the agent step loop, up to a capped number of attempts.
    Retry,
}

/// A node in a [`Plan`]: one atomic unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub goal: String,
    pub assigned_agent: String,
    pub dependencies: HashSet<TaskId>,
    pub status: TaskStatus,
    pub on_failure: OnFailure,
    pub result: Option<String>,
    pub attempts: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, goal: impl Into<String>, assigned_agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            goal: goal.into(),
            assigned_agent: assigned_agent.into(),
            dependencies: HashSet::new(),
            status: TaskStatus::Pending,
            on_failure: OnFailure::Abort,
            result: None,
            attempts: 0,
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Ready iff pending and every dependency is completed.
    fn is_ready(&self, tasks: &HashMap<TaskId, Task>) -> bool {
        self.status == TaskStatus::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| tasks.get(dep).map(|t| t.status == TaskStatus::Completed).unwrap_or(false))
    }
}

/// Errors raised by [`Plan`] mutation.
#[derive(Debug, Clone)]
pub enum PlanError {
    /// A task id collided with one already in the plan.
    DuplicateTaskId(TaskId),
    /// A dependency refers to no task in this plan, or the dependency graph
    /// contains a cycle. Carries the offending/participating id set.
    InvalidPlan(String, Vec<TaskId>),
    /// `set_status` was asked to apply a transition the status lattice forbids.
    InvalidTransition(TaskId, TaskStatus, TaskStatus),
    /// `revise` would remove a task that is still `running`.
    RevisionConflict(TaskId),
    /// The referenced task id does not exist in the plan.
    TaskNotFound(TaskId),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::DuplicateTaskId(id) => write!(f, "duplicate task id: {}", id),
            PlanError::InvalidPlan(reason, ids) => {
                write!(f, "invalid plan ({}): {:?}", reason, ids)
            }
            PlanError::InvalidTransition(id, from, to) => write!(
                f,
                "invalid status transition for task {}: {:?} -> {:?}",
                id, from, to
            ),
            PlanError::RevisionConflict(id) => {
                write!(f, "cannot revise: task {} is still running", id)
            }
            PlanError::TaskNotFound(id) => write!(f, "task not found: {}", id),
        }
    }
}

impl std::error::Error for PlanError {}

/// A DAG of tasks addressing one goal, with a monotonically increasing version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    tasks: HashMap<TaskId, Task>,
    pub version: u64,
}

impl Plan {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            tasks: HashMap::new(),
            version: 0,
        }
    }

    /// Construct a plan from a complete task set, validating invariants up front.
    pub fn from_tasks(goal: impl Into<String>, tasks: Vec<Task>) -> Result<Self, PlanError> {
        let mut plan = Self::new(goal);
        for task in tasks {
            plan.insert_unchecked(task);
        }
        plan.validate_acyclic()?;
        plan.validate_edges()?;
        Ok(plan)
    }

    fn insert_unchecked(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    fn validate_edges(&self) -> Result<(), PlanError> {
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(PlanError::InvalidPlan(
                        "dangling dependency".to_string(),
                        vec![task.id.clone(), dep.clone()],
                    ));
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm: repeatedly remove nodes with in-degree zero. Any
    /// nodes left over after the reduction terminates participate in a cycle.
    fn validate_acyclic(&self) -> Result<(), PlanError> {
        // in_degree[id] = number of dependencies task `id` still has outstanding.
        let mut in_degree: HashMap<TaskId, usize> = self
            .tasks
            .values()
            .map(|t| (t.id.clone(), t.dependencies.len()))
            .collect();

        let mut queue: VecDeque<TaskId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut visited = 0usize;
        // Map from dependency id -> tasks that depend on it, so we can decrement.
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }

        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(deps) = dependents.get(&id) {
                for dependent in deps {
                    if let Some(count) = in_degree.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
        }

        if visited != self.tasks.len() {
            let cyclic: Vec<TaskId> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg != 0)
                .map(|(id, _)| id)
                .collect();
            return Err(PlanError::InvalidPlan("cycle detected".to_string(), cyclic));
        }
        Ok(())
    }

    /// Add a task to the plan, rejecting duplicate ids, dangling dependencies, or cycles.
    pub fn add_task(&mut self, task: Task) -> Result<(), PlanError> {
        if self.tasks.contains_key(&task.id) {
            return Err(PlanError::DuplicateTaskId(task.id));
        }
        for dep in &task.dependencies {
            if !self.tasks.contains_key(dep) {
                return Err(PlanError::InvalidPlan(
                    "dangling dependency".to_string(),
                    vec![task.id.clone(), dep.clone()],
                ));
            }
        }
        let id = task.id.clone();
        self.insert_unchecked(task);
        if let Err(e) = self.validate_acyclic() {
            self.tasks.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Apply a status transition, enforcing the monotone lattice
    /// `pending -> running -> {completed, failed}`.
    pub fn set_status(&mut self, task_id: &str, new_status: TaskStatus) -> Result<(), PlanError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| PlanError::TaskNotFound(task_id.to_string()))?;

        let allowed = matches!(
            (task.status, new_status),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Failed)
        ) || task.status == new_status;

        if !allowed {
            return Err(PlanError::InvalidTransition(
                task_id.to_string(),
                task.status,
                new_status,
            ));
        }
        task.status = new_status;
        Ok(())
    }

    /// Set the free-text completion summary for a task.
    pub fn set_result(&mut self, task_id: &str, result: impl Into<String>) -> Result<(), PlanError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| PlanError::TaskNotFound(task_id.to_string()))?;
        task.result = Some(result.into());
        Ok(())
    }

    /// Increment a task's retry counter, returning the new count.
    pub fn increment_attempts(&mut self, task_id: &str) -> Result<u32, PlanError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| PlanError::TaskNotFound(task_id.to_string()))?;
        task.attempts += 1;
        Ok(task.attempts)
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks whose status is pending and whose dependencies are all completed.
    /// Order is unspecified.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.is_ready(&self.tasks)).collect()
    }

    /// Whether every task has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.tasks
            .values()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
    }

    /// Atomically replace the task set with `new_tasks`. Tasks whose id
    /// appears in both sets retain their `status`, `result`, and `attempts`.
    /// Removing a `running` task is rejected. The resulting graph must
    /// satisfy all invariants; `version` is incremented on success.
    pub fn revise(&mut self, new_tasks: Vec<Task>) -> Result<(), PlanError> {
        let new_ids: HashSet<&TaskId> = new_tasks.iter().map(|t| &t.id).collect();
        for old in self.tasks.values() {
            if !new_ids.contains(&old.id)
                && !matches!(old.status, TaskStatus::Completed | TaskStatus::Pending)
            {
                return Err(PlanError::RevisionConflict(old.id.clone()));
            }
        }

        let mut merged: HashMap<TaskId, Task> = HashMap::new();
        for mut task in new_tasks {
            if let Some(old) = self.tasks.get(&task.id) {
                task.status = old.status;
                task.result = old.result.clone();
                task.attempts = old.attempts;
            }
            merged.insert(task.id.clone(), task);
        }

        let previous = std::mem::replace(&mut self.tasks, merged);
        if let Err(e) = self.validate_edges().and_then(|_| self.validate_acyclic()) {
            self.tasks = previous;
            return Err(e);
        }

        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_task_rejects_dangling_dependency() {
        let mut plan = Plan::new("ship the feature");
        let task = Task::new("t1", "step one", "do the thing", "worker")
            .with_dependencies(["missing".to_string()]);
        let err = plan.add_task(task).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPlan(_, _)));
    }

    #[test]
    fn add_task_rejects_cycle() {
        let mut plan = Plan::new("ship the feature");
        plan.add_task(Task::new("a", "a", "a", "w")).unwrap();
        plan.add_task(Task::new("b", "b", "b", "w").with_dependencies(["a".to_string()]))
            .unwrap();

        // Manually construct a cyclic graph via revise to exercise validate_acyclic.
        let cyclic = vec![
            Task::new("a", "a", "a", "w").with_dependencies(["b".to_string()]),
            Task::new("b", "b", "b", "w").with_dependencies(["a".to_string()]),
        ];
        let err = plan.revise(cyclic).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPlan(_, _)));
    }

    #[test]
    fn ready_tasks_respects_dependencies() {
        let mut plan = Plan::new("goal");
        plan.add_task(Task::new("a", "a", "a", "w")).unwrap();
        plan.add_task(Task::new("b", "b", "b", "w").with_dependencies(["a".to_string()]))
            .unwrap();

        let ready: Vec<&str> = plan.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        plan.set_status("a", TaskStatus::Running).unwrap();
        plan.set_status("a", TaskStatus::Completed).unwrap();

        let ready: Vec<&str> = plan.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn set_status_rejects_backwards_transition() {
        let mut plan = Plan::new("goal");
        plan.add_task(Task::new("a", "a", "a", "w")).unwrap();
        plan.set_status("a", TaskStatus::Running).unwrap();
        plan.set_status("a", TaskStatus::Completed).unwrap();

        let err = plan.set_status("a", TaskStatus::Running).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition(_, _, _)));
    }

    #[test]
    fn revise_preserves_completed_status_and_result() {
        let mut plan = Plan::new("goal");
        plan.add_task(Task::new("a", "a", "a", "w")).unwrap();
        plan.set_status("a", TaskStatus::Running).unwrap();
        plan.set_status("a", TaskStatus::Completed).unwrap();
        plan.set_result("a", "done").unwrap();

        plan.revise(vec![
            Task::new("a", "a revised", "a", "w"),
            Task::new("b", "b", "b", "w").with_dependencies(["a".to_string()]),
        ])
        .unwrap();

        let a = plan.get("a").unwrap();
        assert_eq!(a.status, TaskStatus::Completed);
        assert_eq!(a.result.as_deref(), Some("done"));
        assert_eq!(plan.version, 1);
    }

    #[test]
    fn revise_rejects_removing_running_task() {
        let mut plan = Plan::new("goal");
        plan.add_task(Task::new("a", "a", "a", "w")).unwrap();
        plan.set_status("a", TaskStatus::Running).unwrap();

        let err = plan.revise(vec![]).unwrap_err();
        assert!(matches!(err, PlanError::RevisionConflict(_)));
    }

    #[test]
    fn is_complete_requires_terminal_status_for_all_tasks() {
        let mut plan = Plan::new("goal");
        plan.add_task(Task::new("a", "a", "a", "w")).unwrap();
        assert!(!plan.is_complete());

        plan.set_status("a", TaskStatus::Running).unwrap();
        plan.set_status("a", TaskStatus::Failed).unwrap();
        assert!(plan.is_complete());
    }
}
