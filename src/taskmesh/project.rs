//! The [`Project`] aggregate and its process-wide registry.
//!
//! A project bundles a goal, a configuration, a plan, and a conversation
//! behind the locks the rest of the crate's concurrency model expects: the
//! plan is mutated only by the scheduler/coordinator under its own mutex, and
//! the conversation is append-only and serialized per project, matching
//! `ToolRegistry`'s read-mostly-behind-a-lock convention.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::taskmesh::config::TeamConfig;
use crate::taskmesh::message_builder::Message;
use crate::taskmesh::plan::Plan;

/// Lifecycle status of a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One user-facing unit of work: a goal, its team configuration, the plan
/// addressing it, and the conversation produced while working it.
///
/// `plan` and `conversation` are locked independently so a task worker
/// appending conversation doesn't contend with the scheduler mutating plan
/// status, and vice versa.
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub goal: String,
    pub config: TeamConfig,
    pub workspace_root: PathBuf,
    pub status: Mutex<ProjectStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Mutex<DateTime<Utc>>,
    pub plan: Mutex<Option<Plan>>,
    pub conversation: Mutex<Vec<Message>>,
}

impl Project {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, goal: impl Into<String>, config: TeamConfig, workspace_root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            goal: goal.into(),
            config,
            workspace_root,
            status: Mutex::new(ProjectStatus::Pending),
            created_at: now,
            updated_at: Mutex::new(now),
            plan: Mutex::new(None),
            conversation: Mutex::new(Vec::new()),
        }
    }

    pub async fn touch(&self) {
        *self.updated_at.lock().await = Utc::now();
    }

    pub async fn status(&self) -> ProjectStatus {
        *self.status.lock().await
    }

    pub async fn set_status(&self, status: ProjectStatus) {
        *self.status.lock().await = status;
        self.touch().await;
    }

    pub async fn append_message(&self, message: Message) {
        self.conversation.lock().await.push(message);
        self.touch().await;
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.conversation.lock().await.clone()
    }
}

/// An immutable snapshot of a [`Project`]'s state, safe to hand to a caller
/// without holding any of the project's locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub id: String,
    pub user_id: String,
    pub goal: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub plan: Option<Plan>,
}

impl Project {
    pub async fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            goal: self.goal.clone(),
            status: self.status().await,
            created_at: self.created_at,
            updated_at: *self.updated_at.lock().await,
            plan: self.plan.lock().await.clone(),
        }
    }
}

/// Errors raised by a [`ProjectStore`].
#[derive(Debug, Clone)]
pub enum ProjectStoreError {
    Io(String),
}

impl std::fmt::Display for ProjectStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStoreError::Io(msg) => write!(f, "project store I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ProjectStoreError {}

/// Durable persistence for project snapshots, conceptually laid out as
/// `projects/<projectID>/{project.json,plan.json,messages.jsonl}`. This crate
/// ships only [`NoopProjectStore`]; a host process that needs durability
/// across restarts supplies its own implementation.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<(), ProjectStoreError>;
    async fn load(&self, project_id: &str) -> Result<Option<ProjectSnapshot>, ProjectStoreError>;
    async fn delete(&self, project_id: &str) -> Result<(), ProjectStoreError>;
}

/// A [`ProjectStore`] that persists nothing; every project lives only in the
/// in-process [`ProjectRegistry`] for the life of the host process.
pub struct NoopProjectStore;

#[async_trait]
impl ProjectStore for NoopProjectStore {
    async fn save(&self, _snapshot: &ProjectSnapshot) -> Result<(), ProjectStoreError> {
        Ok(())
    }

    async fn load(&self, _project_id: &str) -> Result<Option<ProjectSnapshot>, ProjectStoreError> {
        Ok(None)
    }

    async fn delete(&self, _project_id: &str) -> Result<(), ProjectStoreError> {
        Ok(())
    }
}

/// Process-wide table of live projects, keyed by id.
///
/// Explicit shared state passed around via `Arc`, rather than a hidden
/// global, following the same pattern `ToolRegistry` uses for its one
/// process-wide instance.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: Mutex<HashMap<String, Arc<Project>>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, project: Arc<Project>) {
        self.projects.lock().await.insert(project.id.clone(), project);
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<Project>> {
        self.projects.lock().await.get(project_id).cloned()
    }

    pub async fn remove(&self, project_id: &str) -> Option<Arc<Project>> {
        self.projects.lock().await.remove(project_id)
    }

    pub async fn len(&self) -> usize {
        self.projects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// A stored artifact, identified by `(project_id, name, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub version: u64,
    pub mime_type: String,
    pub size: usize,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Errors raised by a [`FileStore`].
#[derive(Debug, Clone)]
pub enum FileStoreError {
    NotFound(String),
}

impl std::fmt::Display for FileStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStoreError::NotFound(name) => write!(f, "artifact not found: {}", name),
        }
    }
}

impl std::error::Error for FileStoreError {}

/// Durable storage for task-produced artifacts, versioned by
/// compare-and-append: the store assigns each new write the next version for
/// that name atomically, so concurrent same-name writes never collide.
/// Tools persist artifacts through this trait; `AgentRunner` itself never
/// writes to it directly.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn write(&self, project_id: &str, name: &str, mime_type: &str, content: Vec<u8>) -> Result<Artifact, FileStoreError>;
    async fn read(&self, project_id: &str, name: &str, version: Option<u64>) -> Result<Artifact, FileStoreError>;
    async fn list(&self, project_id: &str) -> Result<Vec<Artifact>, FileStoreError>;
}

/// A [`FileStore`] that acknowledges writes without retaining them. Useful
/// when the host process doesn't need artifact persistence at all.
pub struct NoopFileStore;

#[async_trait]
impl FileStore for NoopFileStore {
    async fn write(&self, _project_id: &str, name: &str, mime_type: &str, content: Vec<u8>) -> Result<Artifact, FileStoreError> {
        Ok(Artifact {
            name: name.to_string(),
            version: 1,
            mime_type: mime_type.to_string(),
            size: content.len(),
            content,
            created_at: Utc::now(),
        })
    }

    async fn read(&self, _project_id: &str, name: &str, _version: Option<u64>) -> Result<Artifact, FileStoreError> {
        Err(FileStoreError::NotFound(name.to_string()))
    }

    async fn list(&self, _project_id: &str) -> Result<Vec<Artifact>, FileStoreError> {
        Ok(Vec::new())
    }
}
