//! Conversation-window trimming for prompt composition.
//!
//! [`AgentRunner`](crate::taskmesh::agent_runner::AgentRunner) composes model
//! input from the project's full conversation, which can grow unbounded over
//! a long-running project. A [`ContextStrategy`] decides which subset of
//! messages actually goes into the prompt. The default, [`TrimStrategy`],
//! keeps the most recent messages (default 32) while always including every
//! message tied to the task currently being worked, so a task's own history
//! is never silently dropped even if it falls outside the recency window.
//!
//! ```rust
//! use taskmesh::context_strategy::{ContextStrategy, TrimStrategy};
//! use taskmesh::message_builder::{Message, Role};
//!
//! let strategy = TrimStrategy::default();
//! let messages: Vec<Message> = vec![];
//! let windowed = strategy.window(&messages, Some("task-1"));
//! assert!(windowed.is_empty());
//! ```

use crate::taskmesh::message_builder::Message;

/// Default number of trailing messages kept in the prompt window.
pub const DEFAULT_WINDOW_SIZE: usize = 32;

/// Decides which messages from a project's conversation are included when
/// composing a model prompt.
pub trait ContextStrategy: Send + Sync {
    /// Return the subset of `messages` to include in the prompt, in their
    /// original order. `current_task_id`, when present, identifies messages
    /// that must be retained regardless of recency.
    fn window(&self, messages: &[Message], current_task_id: Option<&str>) -> Vec<Message>;

    fn name(&self) -> &str;
}

/// Keeps the last `size` messages, always including every message whose
/// `task_id` matches the task currently being worked.
pub struct TrimStrategy {
    pub size: usize,
}

impl Default for TrimStrategy {
    fn default() -> Self {
        Self { size: DEFAULT_WINDOW_SIZE }
    }
}

impl TrimStrategy {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ContextStrategy for TrimStrategy {
    fn window(&self, messages: &[Message], current_task_id: Option<&str>) -> Vec<Message> {
        if messages.len() <= self.size {
            return messages.to_vec();
        }

        let tail_start = messages.len() - self.size;
        let mut kept_indices: Vec<usize> = (tail_start..messages.len()).collect();

        if let Some(task_id) = current_task_id {
            for (index, message) in messages.iter().enumerate().take(tail_start) {
                if message.task_id.as_deref() == Some(task_id) {
                    kept_indices.push(index);
                }
            }
            kept_indices.sort_unstable();
            kept_indices.dedup();
        }

        kept_indices.into_iter().map(|i| messages[i].clone()).collect()
    }

    fn name(&self) -> &str {
        "TrimStrategy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmesh::message_builder::Role;

    fn message(id: &str, task_id: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            project_id: "p1".to_string(),
            task_id: task_id.map(|s| s.to_string()),
            role: Role::User,
            timestamp: chrono::Utc::now(),
            parts: vec![],
            content: id.to_string(),
        }
    }

    #[test]
    fn window_returns_everything_when_under_the_limit() {
        let strategy = TrimStrategy::new(5);
        let messages = vec![message("1", None), message("2", None)];
        assert_eq!(strategy.window(&messages, None).len(), 2);
    }

    #[test]
    fn window_keeps_only_the_tail_when_over_the_limit() {
        let strategy = TrimStrategy::new(2);
        let messages: Vec<Message> = (0..5).map(|i| message(&i.to_string(), None)).collect();
        let windowed = strategy.window(&messages, None);
        let ids: Vec<&str> = windowed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4"]);
    }

    #[test]
    fn window_always_includes_current_task_messages_outside_the_tail() {
        let strategy = TrimStrategy::new(2);
        let messages = vec![
            message("old-task-msg", Some("task-1")),
            message("1", None),
            message("2", None),
            message("3", None),
            message("4", None),
        ];
        let windowed = strategy.window(&messages, Some("task-1"));
        let ids: Vec<&str> = windowed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["old-task-msg", "3", "4"]);
    }
}
