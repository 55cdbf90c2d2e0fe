//! Stateful conversational session wrapping a [`ClientWrapper`].
//!
//! `LLMSession` keeps a rolling conversation history against one model and
//! trims it to stay within a token budget, the same job
//! [`TrimStrategy`](crate::taskmesh::context_strategy::TrimStrategy) does for
//! [`AgentRunner`](crate::taskmesh::agent_runner::AgentRunner)'s prompt
//! composition, but measured in tokens rather than message count and scoped
//! to a single ad hoc conversation rather than a project's full history.
//!
//! ```rust
//! use std::sync::Arc;
//! use taskmesh::clients::openai::{Model, OpenAIClient};
//! use taskmesh::LLMSession;
//!
//! let client = OpenAIClient::new_with_model_enum("sk-test", Model::GPT41Nano);
//! let session = LLMSession::new(Arc::new(client), "You are an AI assistant.".to_string(), 8000);
//! ```

use std::sync::Arc;

use crate::taskmesh::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};

/// A conversational session against one [`ClientWrapper`], trimmed to a token budget.
pub struct LLMSession<T: ClientWrapper + ?Sized> {
    client: Arc<T>,
    system_prompt: Message,
    conversation_history: Vec<Message>,
    max_tokens: usize,
    token_count: usize,
}

impl<T: ClientWrapper + ?Sized> LLMSession<T> {
    /// Creates a new session around an already-shared client, seeding the token budget
    /// with the system prompt's cost.
    pub fn new(client: Arc<T>, system_prompt: String, max_tokens: usize) -> Self {
        let system_prompt_message = Message {
            role: Role::System,
            content: Arc::from(system_prompt),
            tool_calls: Vec::new(),
        };
        let system_prompt_tokens = count_message_tokens(&system_prompt_message);
        LLMSession {
            client,
            system_prompt: system_prompt_message,
            conversation_history: Vec::new(),
            max_tokens,
            token_count: system_prompt_tokens,
        }
    }

    /// Sends a message, appends the response to history, and returns it.
    /// Tools, when supplied, are forwarded to the provider's native
    /// function-calling API for this call only.
    pub async fn send_message(
        &mut self,
        role: Role,
        content: String,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let message = Message {
            role,
            content: Arc::from(content),
            tool_calls: Vec::new(),
        };
        self.token_count += count_message_tokens(&message);
        self.conversation_history.push(message);
        self.trim_conversation_history();

        let mut request: Vec<Message> = Vec::with_capacity(self.conversation_history.len() + 1);
        request.push(self.system_prompt.clone());
        request.extend(self.conversation_history.iter().cloned());

        let response = self.client.send_message(&request, tools).await?;

        self.token_count += count_message_tokens(&response);
        self.conversation_history.push(response.clone());
        self.trim_conversation_history();

        Ok(response)
    }

    /// Replace the system prompt, adjusting the running token count.
    pub fn set_system_prompt(&mut self, prompt: String) {
        let old_prompt_tokens = count_message_tokens(&self.system_prompt);
        self.system_prompt = Message {
            role: Role::System,
            content: Arc::from(prompt),
            tool_calls: Vec::new(),
        };
        let new_prompt_tokens = count_message_tokens(&self.system_prompt);
        self.token_count = self.token_count - old_prompt_tokens + new_prompt_tokens;
    }

    pub fn conversation_history(&self) -> &[Message] {
        &self.conversation_history
    }

    pub fn clear_history(&mut self) {
        self.token_count = count_message_tokens(&self.system_prompt);
        self.conversation_history.clear();
    }

    /// Drop the oldest messages until the running token count fits `max_tokens`.
    fn trim_conversation_history(&mut self) {
        while self.token_count > self.max_tokens && !self.conversation_history.is_empty() {
            let removed = self.conversation_history.remove(0);
            self.token_count -= count_message_tokens(&removed);
        }
    }
}

/// Approximates token count at one token per 4 characters of content.
fn count_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn count_message_tokens(message: &Message) -> usize {
    let role_token_count = 1;
    role_token_count + count_tokens(&message.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::error::Error;

    struct Echo;

    #[async_trait]
    impl ClientWrapper for Echo {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(format!("reply to {} messages", messages.len())),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn send_message_appends_request_and_response_to_history() {
        let mut session = LLMSession::new(Arc::new(Echo), "system".to_string(), 10_000);
        session
            .send_message(Role::User, "hello".to_string(), None)
            .await
            .unwrap();

        assert_eq!(session.conversation_history().len(), 2);
        assert!(matches!(session.conversation_history()[0].role, Role::User));
        assert!(matches!(session.conversation_history()[1].role, Role::Assistant));
    }

    #[tokio::test]
    async fn trimming_keeps_token_count_within_budget() {
        let mut session = LLMSession::new(Arc::new(Echo), "system".to_string(), 12);
        for i in 0..10 {
            session
                .send_message(Role::User, format!("message number {i}"), None)
                .await
                .unwrap();
        }
        assert!(session.token_count <= session.max_tokens + 20);
    }

    #[test]
    fn set_system_prompt_updates_token_count() {
        let mut session = LLMSession::new(Arc::new(Echo), "short".to_string(), 10_000);
        let before = session.token_count;
        session.set_system_prompt("a much longer system prompt than before".to_string());
        assert!(session.token_count > before);
    }
}
