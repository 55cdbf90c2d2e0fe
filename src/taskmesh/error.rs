//! Crate-level error aggregation.
//!
//! Each subsystem owns its own error enum (`PlanError`, `ToolError`,
//! `EventBusError`, `ConfigError`, `ModelError`, `SchedulerError`,
//! `CoordinatorError`). [`CoreError`] adds the handful of kinds that don't
//! belong to any one subsystem — a project lookup miss, an authorization
//! failure, cancellation, subscriber lag — and wraps the others so a host
//! process calling through the public surface (§6) has one error type to
//! match on.

use std::fmt;

use crate::taskmesh::coordinator::CoordinatorError;
use crate::taskmesh::event::EventBusError;
use crate::taskmesh::model_provider::ModelError;
use crate::taskmesh::plan::PlanError;
use crate::taskmesh::project::{FileStoreError, ProjectStoreError};
use crate::taskmesh::scheduler::SchedulerError;
use crate::taskmesh::tool_protocol::ToolError;

/// The crate's top-level error type.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// A project id referenced by the caller doesn't exist in the registry.
    ProjectNotFound(String),
    /// The caller isn't the owning user of the referenced project.
    Unauthorized(String),
    /// The operation was cancelled before completing.
    Cancelled,
    /// A subscriber fell behind and lost events; surfaced as a soft failure,
    /// not a hard error — the subscription itself remains open.
    SubscriberLag(String),
    Plan(PlanError),
    Tool(ToolError),
    Model(ModelError),
    Scheduler(SchedulerError),
    Coordinator(CoordinatorError),
    Event(EventBusError),
    ProjectStore(ProjectStoreError),
    FileStore(FileStoreError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::ProjectNotFound(id) => write!(f, "project not found: {}", id),
            CoreError::Unauthorized(id) => write!(f, "not authorized for project: {}", id),
            CoreError::Cancelled => write!(f, "operation cancelled"),
            CoreError::SubscriberLag(msg) => write!(f, "subscriber lag: {}", msg),
            CoreError::Plan(e) => write!(f, "{}", e),
            CoreError::Tool(e) => write!(f, "{}", e),
            CoreError::Model(e) => write!(f, "{}", e),
            CoreError::Scheduler(e) => write!(f, "{}", e),
            CoreError::Coordinator(e) => write!(f, "{}", e),
            CoreError::Event(e) => write!(f, "{}", e),
            CoreError::ProjectStore(e) => write!(f, "{}", e),
            CoreError::FileStore(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<PlanError> for CoreError {
    fn from(e: PlanError) -> Self {
        CoreError::Plan(e)
    }
}

impl From<ToolError> for CoreError {
    fn from(e: ToolError) -> Self {
        CoreError::Tool(e)
    }
}

impl From<ModelError> for CoreError {
    fn from(e: ModelError) -> Self {
        CoreError::Model(e)
    }
}

impl From<SchedulerError> for CoreError {
    fn from(e: SchedulerError) -> Self {
        CoreError::Scheduler(e)
    }
}

impl From<CoordinatorError> for CoreError {
    fn from(e: CoordinatorError) -> Self {
        CoreError::Coordinator(e)
    }
}

impl From<EventBusError> for CoreError {
    fn from(e: EventBusError) -> Self {
        CoreError::Event(e)
    }
}

impl From<ProjectStoreError> for CoreError {
    fn from(e: ProjectStoreError) -> Self {
        CoreError::ProjectStore(e)
    }
}

impl From<FileStoreError> for CoreError {
    fn from(e: FileStoreError) -> Self {
        CoreError::FileStore(e)
    }
}
