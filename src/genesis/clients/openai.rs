//! OpenAI-compatible chat-completions adapter.
//!
//! Implements [`LlmAdapter`] against any endpoint speaking the OpenAI chat
//! completions wire format (OpenAI itself, or self-hosted gateways exposing
//! the same surface). All schema translation between the runtime's message
//! types and the provider JSON happens here and nowhere else.

use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::genesis::config::ToolChoiceMode;
use crate::genesis::error::GenesisError;
use crate::genesis::llm_adapter::{
    ChatMessage, LlmAdapter, LlmResponse, NativeToolCall, Role, ToolDefinition,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// [`LlmAdapter`] for OpenAI-compatible endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    tool_choice: ToolChoiceMode,
}

impl OpenAiCompatClient {
    /// Create a client for the hosted OpenAI endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let http = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            tool_choice: ToolChoiceMode::Auto,
        }
    }

    /// Point the client at a compatible self-hosted endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the tool-choice constraint reported to the orchestrator.
    pub fn with_tool_choice(mut self, tool_choice: ToolChoiceMode) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    /// Build from the environment: the key comes from `OPEN_AI_SECRET`.
    ///
    /// A missing key is the "provider-required env missing" condition;
    /// launchers should map it to exit code 4.
    pub fn from_env(model: impl Into<String>) -> Result<Self, GenesisError> {
        let key = std::env::var("OPEN_AI_SECRET").map_err(|_| {
            GenesisError::Configuration("OPEN_AI_SECRET is not set".to_string())
        })?;
        Ok(Self::new(key, model))
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    fn encode_message(message: &ChatMessage) -> Value {
        match &message.role {
            Role::System => json!({"role": "system", "content": message.content.clone()}),
            Role::User => json!({"role": "user", "content": message.content.clone()}),
            Role::Assistant => {
                let mut encoded =
                    json!({"role": "assistant", "content": message.content.clone()});
                if !message.tool_calls.is_empty() {
                    let calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id.clone(),
                                "type": "function",
                                "function": {
                                    "name": call.name.clone(),
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    encoded["tool_calls"] = Value::Array(calls);
                }
                encoded
            }
            Role::Tool { call_id } => json!({
                "role": "tool",
                "tool_call_id": call_id.clone(),
                "content": message.content.clone(),
            }),
        }
    }

    fn decode_tool_calls(message: &Value) -> Vec<NativeToolCall> {
        let calls = match message.get("tool_calls").and_then(|v| v.as_array()) {
            Some(calls) => calls,
            None => return Vec::new(),
        };
        calls
            .iter()
            .filter_map(|call| {
                let id = call.get("id")?.as_str()?.to_string();
                let function = call.get("function")?;
                let name = function.get("name")?.as_str()?.to_string();
                // The wire carries arguments as a JSON-encoded string.
                let arguments = function
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or(Value::Null);
                Some(NativeToolCall {
                    id,
                    name,
                    arguments,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmAdapter for OpenAiCompatClient {
    async fn call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoiceMode,
    ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>> {
        let mut body = json!({
            "model": self.model.clone(),
            "messages": messages.iter().map(Self::encode_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            let encoded: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name.clone(),
                            "description": tool.description.clone(),
                            "parameters": tool.parameters_schema.clone(),
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(encoded);
            body["tool_choice"] = Value::String(tool_choice.to_string());
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw: Value = response.json().await?;
        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAiCompatClient::call: provider returned {}: {}",
                    status,
                    raw
                );
            }
            return Err(Box::new(GenesisError::LlmUnavailable(format!(
                "provider returned {}",
                status
            ))));
        }

        let message = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| {
                Box::new(GenesisError::LlmUnavailable(
                    "response carried no choices".to_string(),
                )) as Box<dyn Error + Send + Sync>
            })?;

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let tool_calls = Self::decode_tool_calls(message);
        let finish_reason = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(LlmResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
                tool_calls,
            },
            finish_reason,
            raw,
        })
    }

    fn get_tool_choice(&self) -> ToolChoiceMode {
        self.tool_choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_round_trip_through_wire_shape() {
        let message = ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: vec![NativeToolCall {
                id: "call_1".to_string(),
                name: "add".to_string(),
                arguments: json!({"x": 2, "y": 3}),
            }],
        };
        let encoded = OpenAiCompatClient::encode_message(&message);
        assert_eq!(encoded["tool_calls"][0]["function"]["name"], "add");

        let decoded = OpenAiCompatClient::decode_tool_calls(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].arguments["x"], 2);
    }

    #[test]
    fn tool_role_carries_call_id() {
        let message = ChatMessage::tool_result("call_9", "5");
        let encoded = OpenAiCompatClient::encode_message(&message);
        assert_eq!(encoded["role"], "tool");
        assert_eq!(encoded["tool_call_id"], "call_9");
    }
}
