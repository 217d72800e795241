//! Provider-agnostic LLM adapter boundary.
//!
//! The orchestrator never talks to a provider directly; it goes through
//! [`LlmAdapter`], the sole place where provider-specific schema translation
//! lives. The trait has exactly six capabilities: issue a completion with a
//! toolset, format a request into messages, extract tool calls, extract
//! terminal text, build the assistant message to append to history, and
//! report the configured tool-choice mode.
//!
//! Everything except [`LlmAdapter::call`] has a sensible default, so a stub
//! adapter for tests only needs to script the completion itself.

use std::error::Error;

use async_trait::async_trait;

use crate::genesis::config::ToolChoiceMode;

/// Role of one chat message.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// A tool-result message correlated to a prior assistant tool call.
    Tool { call_id: String },
}

/// One tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeToolCall {
    /// Provider-assigned call id, echoed back in the tool-result message.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema handed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Non-empty only on assistant messages that requested tool calls.
    pub tool_calls: Vec<NativeToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Tool-result message answering the call with the given id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// One completion from the provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The assistant message, including any requested tool calls.
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
    /// The raw provider response, for diagnostics.
    pub raw: serde_json::Value,
}

/// The six-capability LLM provider boundary.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Issue one completion with the given toolset.
    async fn call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoiceMode,
    ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>>;

    /// Build the opening message array for a turn. Memory items, when
    /// present, are folded into the system message.
    fn format_messages(
        &self,
        user_message: &str,
        system_prompt: &str,
        memory: &[String],
    ) -> Vec<ChatMessage> {
        let mut system = system_prompt.to_string();
        if !memory.is_empty() {
            system.push_str("\n\nRelevant memory:\n");
            for item in memory {
                system.push_str("- ");
                system.push_str(item);
                system.push('\n');
            }
        }
        vec![ChatMessage::system(system), ChatMessage::user(user_message)]
    }

    /// Tool calls requested by this completion, in order.
    fn extract_tool_calls(&self, response: &LlmResponse) -> Vec<NativeToolCall> {
        response.message.tool_calls.clone()
    }

    /// Terminal text of this completion, if it is one. A completion that
    /// requested tool calls is not terminal.
    fn extract_text(&self, response: &LlmResponse) -> Option<String> {
        if response.message.tool_calls.is_empty() {
            Some(response.message.content.clone())
        } else {
            None
        }
    }

    /// The assistant message to append to the conversation history.
    fn create_assistant_message(&self, response: &LlmResponse) -> ChatMessage {
        response.message.clone()
    }

    /// The tool-choice constraint this adapter was configured with.
    fn get_tool_choice(&self) -> ToolChoiceMode {
        ToolChoiceMode::Auto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl LlmAdapter for Fixed {
        async fn call(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _tool_choice: ToolChoiceMode,
        ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>> {
            Ok(LlmResponse {
                message: ChatMessage::assistant("done"),
                finish_reason: Some("stop".to_string()),
                raw: json!({}),
            })
        }
    }

    #[test]
    fn format_messages_folds_memory_into_system() {
        let adapter = Fixed;
        let messages = adapter.format_messages("hi", "You are helpful.", &["fact".to_string()]);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("Relevant memory"));
        assert!(messages[0].content.contains("fact"));
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn completion_with_tool_calls_is_not_terminal() {
        let adapter = Fixed;
        let response = LlmResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![NativeToolCall {
                    id: "c1".to_string(),
                    name: "add".to_string(),
                    arguments: json!({}),
                }],
            },
            finish_reason: None,
            raw: json!({}),
        };
        assert!(adapter.extract_text(&response).is_none());
        assert_eq!(adapter.extract_tool_calls(&response).len(), 1);
    }
}
