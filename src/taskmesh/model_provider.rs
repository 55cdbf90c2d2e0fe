//! The external model-calling seam: [`ModelProvider`].
//!
//! [`AgentRunner`](crate::taskmesh::agent_runner::AgentRunner) and
//! [`XCoordinator`](crate::taskmesh::coordinator::XCoordinator) call models
//! through this trait rather than a concrete [`ClientWrapper`] directly, so
//! that tests can substitute an in-process fake with no network calls.
//! [`ClientWrapperProvider`] is the production bridge over any existing
//! [`ClientWrapper`] implementation (OpenAI, Gemini, Grok, Claude).

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::taskmesh::client_wrapper::{self, ClientWrapper};
use crate::taskmesh::message_builder::{Message, Part, Role};
use crate::taskmesh::tool_protocol::{ToolParameterType, ToolSchema};

/// A single tool call the model asked to run, carried in a [`ModelCompletion`].
#[derive(Debug, Clone)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of one [`ModelProvider::complete`] call.
#[derive(Debug, Clone)]
pub struct ModelCompletion {
    pub text: String,
    pub tool_calls: Vec<ModelToolCall>,
    /// Provider-reported completion reason, e.g. `"stop"`.
    pub finish_reason: Option<String>,
}

/// Errors raised by a [`ModelProvider`].
#[derive(Debug, Clone)]
pub enum ModelError {
    /// The underlying call failed (network, auth, rate limit, ...).
    CallFailed(String),
    /// The model's response could not be interpreted in the requested shape
    /// (e.g. `completeStructured` expected JSON and got prose).
    OutputInvalid(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::CallFailed(msg) => write!(f, "model call failed: {}", msg),
            ModelError::OutputInvalid(msg) => write!(f, "model output invalid: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {}

/// The external capability an [`AgentRunner`](crate::taskmesh::agent_runner::AgentRunner)
/// or [`XCoordinator`](crate::taskmesh::coordinator::XCoordinator) calls out to.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Free-form completion, optionally offering `tools` for native function calling.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ModelCompletion, ModelError>;

    /// Completion constrained to a JSON shape described by `schema`. Used for
    /// plan generation/revision and chat-input classification.
    async fn complete_structured(
        &self,
        messages: &[Message],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ModelError>;

    fn name(&self) -> &str;
}

/// Adapts any [`ClientWrapper`] into a [`ModelProvider`].
///
/// `completeStructured` has no native counterpart in [`ClientWrapper`], so it
/// is implemented by appending an instruction message asking the model to
/// reply with JSON matching `schema` and parsing the result — a minimal
/// approach, not a general structured-output facility, matching this crate's
/// preference for reusing `serde_json` over pulling in a schema-validation
/// dependency.
pub struct ClientWrapperProvider<T: ClientWrapper + ?Sized> {
    client: Arc<T>,
}

impl<T: ClientWrapper + ?Sized> ClientWrapperProvider<T> {
    pub fn new(client: Arc<T>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<T: ClientWrapper + ?Sized> ModelProvider for ClientWrapperProvider<T> {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ModelCompletion, ModelError> {
        let wire_messages: Vec<client_wrapper::Message> = messages.iter().map(to_wire_message).collect();
        let tool_defs = if tools.is_empty() {
            None
        } else {
            Some(tools.iter().map(to_tool_definition).collect())
        };

        let response = self
            .client
            .send_message(&wire_messages, tool_defs)
            .await
            .map_err(|e| ModelError::CallFailed(e.to_string()))?;

        let finish_reason = if response.tool_calls.is_empty() {
            Some("stop".to_string())
        } else {
            None
        };

        Ok(ModelCompletion {
            text: response.content.to_string(),
            tool_calls: response
                .tool_calls
                .into_iter()
                .map(|tc| ModelToolCall {
                    id: tc.id,
                    name: tc.name,
                    arguments: tc.arguments,
                })
                .collect(),
            finish_reason,
        })
    }

    async fn complete_structured(
        &self,
        messages: &[Message],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ModelError> {
        let mut wire_messages: Vec<client_wrapper::Message> = messages.iter().map(to_wire_message).collect();
        wire_messages.push(client_wrapper::Message {
            role: client_wrapper::Role::User,
            content: Arc::from(format!(
                "Respond with a single JSON value matching this schema and nothing else:\n{}",
                schema
            )),
            tool_calls: Vec::new(),
        });

        let response = self
            .client
            .send_message(&wire_messages, None)
            .await
            .map_err(|e| ModelError::CallFailed(e.to_string()))?;

        extract_json(&response.content)
            .ok_or_else(|| ModelError::OutputInvalid("model did not return valid JSON".to_string()))
    }

    fn name(&self) -> &str {
        self.client.model_name()
    }
}

fn to_wire_message(message: &Message) -> client_wrapper::Message {
    let role = match message.role {
        Role::System => client_wrapper::Role::System,
        Role::User => client_wrapper::Role::User,
        Role::Assistant => client_wrapper::Role::Assistant,
        Role::Tool => {
            let call_id = message
                .parts
                .iter()
                .find_map(|part| match part {
                    Part::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            client_wrapper::Role::Tool { call_id }
        }
    };
    client_wrapper::Message {
        role,
        content: Arc::from(message.content.as_str()),
        tool_calls: Vec::new(),
    }
}

fn to_tool_definition(schema: &ToolSchema) -> client_wrapper::ToolDefinition {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in &schema.parameters {
        properties.insert(
            param.name.clone(),
            serde_json::json!({
                "type": param_type_str(&param.param_type),
                "description": param.description.clone().unwrap_or_default(),
            }),
        );
        if param.required {
            required.push(param.name.clone());
        }
    }
    client_wrapper::ToolDefinition {
        name: schema.name.clone(),
        description: schema.description.clone(),
        parameters_schema: serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

fn param_type_str(ty: &ToolParameterType) -> &'static str {
    match ty {
        ToolParameterType::String => "string",
        ToolParameterType::Number => "number",
        ToolParameterType::Integer => "integer",
        ToolParameterType::Boolean => "boolean",
        ToolParameterType::Array => "array",
        ToolParameterType::Object => "object",
    }
}

/// Parses `text` as JSON, falling back to the first `{...}`/`[...]` substring
/// for models that wrap their answer in prose or a code fence.
fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let start = text.find(['{', '['])?;
    let end = text.rfind(['}', ']'])?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_parses_clean_json() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn extract_json_strips_surrounding_prose() {
        let value = extract_json("Sure, here you go:\n```json\n{\"a\": 1}\n```\nHope that helps!").unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn extract_json_returns_none_for_non_json() {
        assert!(extract_json("no json here").is_none());
    }
}
