//! Incremental assembly of a structured [`Message`] from streaming deltas.
//!
//! A [`MessageBuilder`] owns exactly one in-progress message at a time. Each
//! streaming operation (`append_text`, `begin_tool_call`, ...) mutates the
//! open message and returns the [`EventPayload`] that should be published for
//! it, so callers can drive both the builder and the event bus from the same
//! call site.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::taskmesh::event::EventPayload;

/// Role of the speaker that produced a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Lifecycle status of a `toolCall` part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A tagged element of a structured message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
        status: ToolCallStatus,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    Reasoning {
        text: String,
    },
    Error {
        message: String,
        code: Option<String>,
    },
    Image {
        bytes_or_url: String,
        mime_type: String,
    },
    StepBoundary,
}

/// An element of `Project.conversation`.
///
/// `content` is the readable concatenation of text parts plus human-readable
/// inlining of tool results, retained for backward compatibility with model
/// APIs that only accept flat strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub task_id: Option<String>,
    pub role: Role,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub parts: Vec<Part>,
    pub content: String,
}

/// Tracks which part (by index into `Message.parts`) is still accepting
/// deltas, if any.
enum OpenPart {
    Text(usize),
    Reasoning(usize),
    None,
}

/// Incrementally assembles one [`Message`] from streaming builder calls.
pub struct MessageBuilder {
    message: Message,
    open: OpenPart,
    finished: bool,
}

impl MessageBuilder {
    /// Start a new message, returning the builder and the `messageStart` event payload.
    pub fn begin(project_id: impl Into<String>, task_id: Option<String>, role: Role) -> (Self, EventPayload) {
        let project_id = project_id.into();
        let message_id = Uuid::new_v4().to_string();
        let message = Message {
            id: message_id.clone(),
            project_id,
            task_id,
            role,
            timestamp: chrono::Utc::now(),
            parts: Vec::new(),
            content: String::new(),
        };
        let payload = EventPayload::MessageStart {
            message_id,
            role: role_label(role).to_string(),
        };
        (
            Self {
                message,
                open: OpenPart::None,
                finished: false,
            },
            payload,
        )
    }

    pub fn message_id(&self) -> &str {
        &self.message.id
    }

    /// Append a delta to the currently open text part, opening one if none is open.
    ///
    /// Returns the `partComplete` for whatever part this delta closed (if
    /// any), followed by the `partDelta` for this delta.
    pub fn append_text(&mut self, delta: &str) -> Vec<EventPayload> {
        let mut events = Vec::new();
        let index = match self.open {
            OpenPart::Text(index) => {
                if let Some(Part::Text { text }) = self.message.parts.get_mut(index) {
                    text.push_str(delta);
                }
                index
            }
            _ => {
                events.extend(self.close_open_part());
                let index = self.message.parts.len();
                self.message.parts.push(Part::Text { text: delta.to_string() });
                self.open = OpenPart::Text(index);
                index
            }
        };
        events.push(EventPayload::PartDelta {
            message_id: self.message.id.clone(),
            index,
            text: delta.to_string(),
        });
        events
    }

    /// Append a delta to the currently open reasoning part, opening one if none is open.
    ///
    /// Returns the `partComplete` for whatever part this delta closed (if
    /// any), followed by the `partDelta` for this delta.
    pub fn append_reasoning(&mut self, delta: &str) -> Vec<EventPayload> {
        let mut events = Vec::new();
        let index = match self.open {
            OpenPart::Reasoning(index) => {
                if let Some(Part::Reasoning { text }) = self.message.parts.get_mut(index) {
                    text.push_str(delta);
                }
                index
            }
            _ => {
                events.extend(self.close_open_part());
                let index = self.message.parts.len();
                self.message.parts.push(Part::Reasoning { text: delta.to_string() });
                self.open = OpenPart::Reasoning(index);
                index
            }
        };
        events.push(EventPayload::PartDelta {
            message_id: self.message.id.clone(),
            index,
            text: delta.to_string(),
        });
        events
    }

    /// Close any open text/reasoning part and append a new `toolCall` part in
    /// state `pending`. A tool call's arguments are final the moment it's
    /// opened (they don't stream in), so this also emits `partComplete` for
    /// the new part itself, right after `toolCallStart`.
    pub fn begin_tool_call(&mut self, tool_call_id: impl Into<String>, tool_name: impl Into<String>, args: serde_json::Value) -> Vec<EventPayload> {
        let mut events: Vec<EventPayload> = self.close_open_part().into_iter().collect();
        let tool_call_id = tool_call_id.into();
        let tool_name = tool_name.into();
        let index = self.message.parts.len();
        self.message.parts.push(Part::ToolCall {
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            args,
            status: ToolCallStatus::Pending,
        });
        events.push(EventPayload::ToolCallStart {
            message_id: self.message.id.clone(),
            tool_call_id,
            tool_name,
        });
        events.push(EventPayload::PartComplete {
            message_id: self.message.id.clone(),
            index,
        });
        events
    }

    /// Append a `toolResult` part bound to `tool_call_id`, marking the matching
    /// `toolCall` part (if found) as completed or failed.
    pub fn complete_tool_call(&mut self, tool_call_id: impl Into<String>, result: serde_json::Value, is_error: bool) -> Vec<EventPayload> {
        let tool_call_id = tool_call_id.into();
        let tool_name = self
            .message
            .parts
            .iter_mut()
            .find_map(|part| match part {
                Part::ToolCall { tool_call_id: id, tool_name, status, .. } if *id == tool_call_id => {
                    *status = if is_error { ToolCallStatus::Failed } else { ToolCallStatus::Completed };
                    Some(tool_name.clone())
                }
                _ => None,
            })
            .unwrap_or_default();

        let index = self.message.parts.len();
        self.message.parts.push(Part::ToolResult {
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            result,
            is_error,
        });
        vec![
            EventPayload::ToolCallResult {
                message_id: self.message.id.clone(),
                tool_call_id,
                is_error,
            },
            EventPayload::PartComplete {
                message_id: self.message.id.clone(),
                index,
            },
        ]
    }

    /// Append an error part.
    pub fn append_error(&mut self, message: impl Into<String>, code: Option<String>) {
        self.close_open_part();
        self.message.parts.push(Part::Error {
            message: message.into(),
            code,
        });
    }

    /// Append a step-boundary marker.
    pub fn step_boundary(&mut self) {
        self.close_open_part();
        self.message.parts.push(Part::StepBoundary);
    }

    /// Close whichever text/reasoning part is open, if any, returning the
    /// `partComplete` event for it.
    fn close_open_part(&mut self) -> Option<EventPayload> {
        let index = match self.open {
            OpenPart::Text(index) | OpenPart::Reasoning(index) => Some(index),
            OpenPart::None => None,
        };
        self.open = OpenPart::None;
        index.map(|index| EventPayload::PartComplete {
            message_id: self.message.id.clone(),
            index,
        })
    }

    /// Close any open part, abandon any tool calls without a matching result,
    /// compute `content`, and return the finished message along with the
    /// events that closed it: the `partComplete` for whatever part was still
    /// open (if any), followed by `messageComplete`.
    pub fn finish(mut self) -> (Message, Vec<EventPayload>) {
        let mut events: Vec<EventPayload> = self.close_open_part().into_iter().collect();

        let pending_tool_calls: Vec<(String, String)> = self
            .message
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall { tool_call_id, tool_name, status, .. }
                    if !matches!(status, ToolCallStatus::Completed | ToolCallStatus::Failed) =>
                {
                    Some((tool_call_id.clone(), tool_name.clone()))
                }
                _ => None,
            })
            .collect();

        for (tool_call_id, tool_name) in pending_tool_calls {
            for part in &mut self.message.parts {
                if let Part::ToolCall { tool_call_id: id, status, .. } = part {
                    if *id == tool_call_id {
                        *status = ToolCallStatus::Failed;
                    }
                }
            }
            self.message.parts.push(Part::ToolResult {
                tool_call_id,
                tool_name,
                result: serde_json::Value::String("abandoned".to_string()),
                is_error: true,
            });
        }

        self.message.content = render_content(&self.message.parts);
        self.finished = true;

        events.push(EventPayload::MessageComplete { message: self.message.clone() });
        (self.message, events)
    }
}

fn render_content(parts: &[Part]) -> String {
    let mut lines = Vec::new();
    for part in parts {
        match part {
            Part::Text { text } => lines.push(text.clone()),
            Part::ToolResult { tool_name, result, .. } => {
                lines.push(format!(
                    "Tool {} completed.\n{}",
                    tool_name,
                    serde_json::to_string_pretty(result).unwrap_or_default()
                ));
            }
            _ => {}
        }
    }
    lines.join("\n")
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

impl Drop for MessageBuilder {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("MessageBuilder for message {} dropped without finish()", self.message.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_text_accumulates_into_one_open_part() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.append_text("Hello, ");
        builder.append_text("world!");
        let (message, _) = builder.finish();

        assert_eq!(message.parts.len(), 1);
        match &message.parts[0] {
            Part::Text { text } => assert_eq!(text, "Hello, world!"),
            other => panic!("expected text part, got {:?}", other),
        }
        assert_eq!(message.content, "Hello, world!");
    }

    #[test]
    fn tool_call_closes_open_text_part() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.append_text("checking weather");
        builder.begin_tool_call("call-1", "weather", serde_json::json!({"city": "nyc"}));
        builder.append_text("more text");

        let (message, _) = builder.finish();
        assert_eq!(message.parts.len(), 3);
        assert!(matches!(message.parts[0], Part::Text { .. }));
        assert!(matches!(message.parts[1], Part::ToolCall { .. }));
        assert!(matches!(message.parts[2], Part::Text { .. }));
    }

    #[test]
    fn complete_tool_call_marks_matching_call_completed() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.begin_tool_call("call-1", "weather", serde_json::json!({}));
        builder.complete_tool_call("call-1", serde_json::json!({"temp": 70}), false);

        let (message, _) = builder.finish();
        match &message.parts[0] {
            Part::ToolCall { status, .. } => assert_eq!(*status, ToolCallStatus::Completed),
            other => panic!("expected tool call part, got {:?}", other),
        }
        assert!(message.content.contains("Tool weather completed."));
    }

    #[test]
    fn finish_abandons_unresolved_tool_calls() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.begin_tool_call("call-1", "search", serde_json::json!({}));
        let (message, _) = builder.finish();

        assert_eq!(message.parts.len(), 2);
        match &message.parts[1] {
            Part::ToolResult { is_error, result, .. } => {
                assert!(is_error);
                assert_eq!(result, &serde_json::json!("abandoned"));
            }
            other => panic!("expected tool result part, got {:?}", other),
        }
    }

    #[test]
    fn begin_tool_call_closes_the_open_text_part_and_completes_its_own() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.append_text("checking weather");
        let events = builder.begin_tool_call("call-1", "weather", serde_json::json!({"city": "nyc"}));

        assert!(matches!(events[0], EventPayload::PartComplete { index: 0, .. }));
        assert!(matches!(events[1], EventPayload::ToolCallStart { .. }));
        assert!(matches!(events[2], EventPayload::PartComplete { index: 1, .. }));
    }

    #[test]
    fn complete_tool_call_emits_a_part_complete_alongside_the_result() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.begin_tool_call("call-1", "weather", serde_json::json!({}));
        let events = builder.complete_tool_call("call-1", serde_json::json!({"temp": 70}), false);

        assert!(matches!(events[0], EventPayload::ToolCallResult { .. }));
        assert!(matches!(events[1], EventPayload::PartComplete { index: 1, .. }));
    }

    #[test]
    fn finish_emits_a_part_complete_for_a_still_open_text_part() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.append_text("still typing");
        let (_, events) = builder.finish();

        assert!(matches!(events[0], EventPayload::PartComplete { index: 0, .. }));
        assert!(matches!(events[1], EventPayload::MessageComplete { .. }));
    }

    #[test]
    fn tool_call_ids_are_unique_within_a_message() {
        let (mut builder, _) = MessageBuilder::begin("p1", None, Role::Assistant);
        builder.begin_tool_call("call-1", "a", serde_json::json!({}));
        builder.begin_tool_call("call-2", "b", serde_json::json!({}));
        let (message, _) = builder.finish();

        let ids: Vec<&str> = message
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["call-1", "call-2"]);
    }
}
