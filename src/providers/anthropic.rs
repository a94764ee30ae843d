use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    functions::{FunctionCall, FunctionDefinition, ToolCall},
    providers::{openai::timeout_from_env, status_error, LLMProvider},
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, MessageRole, ModelReply, TokenUsage,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 3024;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Messages API adapter. Tool results travel back as `tool_result` blocks in a user turn.
#[derive(Debug, Clone)]
pub struct Anthropic {
    client: Client,
    config: AnthropicConfig,
}

impl Anthropic {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(AnthropicConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .map_err(|_| LLMError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        let mut config = AnthropicConfig::new(api_key);

        if let Ok(base_url) = env::var("ANTHROPIC_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        if let Some(timeout) = timeout_from_env("ANTHROPIC_REQUEST_TIMEOUT_MS") {
            config = config.with_timeout(timeout);
        }

        Self::from_config(config)
    }

    pub fn from_config(config: AnthropicConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MessagesRequestBody {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    content: Option<Vec<ContentBlock>>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub(crate) fn build_request_body(
    request: &CompletionRequest,
) -> Result<MessagesRequestBody, LLMError> {
    let tools = request
        .tools
        .iter()
        .map(wire_tool)
        .collect::<Result<Vec<_>, _>>()?;

    let system = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .filter_map(ChatMessage::text)
        .collect::<Vec<_>>();

    Ok(MessagesRequestBody {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        },
        messages: wire_messages(&request.messages),
        tools,
        temperature: request.temperature,
    })
}

fn wire_tool(definition: &FunctionDefinition) -> Result<WireTool, LLMError> {
    Ok(WireTool {
        name: definition.name.clone(),
        description: definition.description.clone(),
        input_schema: definition.parameters_schema()?,
    })
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .filter_map(|message| match message.role {
            MessageRole::System => None,
            MessageRole::User => Some(WireMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: message.content.clone().unwrap_or_default(),
                }],
            }),
            MessageRole::Assistant => {
                let mut content = Vec::with_capacity(message.tool_calls.len() + 1);
                if let Some(text) = message.text().filter(|t| !t.is_empty()) {
                    content.push(ContentBlock::Text {
                        text: text.to_string(),
                    });
                }
                content.extend(message.tool_calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input: call.function.arguments.clone(),
                }));
                Some(WireMessage {
                    role: "assistant",
                    content,
                })
            }
            MessageRole::Tool => Some(WireMessage {
                role: "user",
                content: message
                    .tool_results
                    .iter()
                    .map(|result| ContentBlock::ToolResult {
                        tool_use_id: result.call_id.clone(),
                        content: result.content(),
                        is_error: result.is_error,
                    })
                    .collect(),
            }),
        })
        .collect()
}

pub(crate) fn parse_response(parsed: MessagesResponse) -> Result<CompletionResponse, LLMError> {
    let usage = parsed
        .usage
        .map(|usage| TokenUsage::new(usage.input_tokens, usage.output_tokens))
        .unwrap_or_default();

    let mut text: Option<String> = None;
    let mut calls = Vec::new();
    for block in parsed.content.unwrap_or_default() {
        match block {
            ContentBlock::Text { text: chunk } => match text.as_mut() {
                Some(existing) => existing.push_str(&chunk),
                None => text = Some(chunk),
            },
            ContentBlock::ToolUse { id, name, input } => {
                let input = if input.is_null() {
                    Value::Object(serde_json::Map::new())
                } else {
                    input
                };
                calls.push(ToolCall::new(id, FunctionCall::new(name, input)));
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Unsupported => {}
        }
    }

    if parsed.stop_reason.as_deref() == Some("tool_use") && calls.is_empty() {
        return Err(LLMError::invalid_response(
            "stop_reason was tool_use but no tool_use block was present",
        ));
    }

    Ok(CompletionResponse {
        reply: ModelReply::from_parts(text, calls),
        usage,
    })
}

#[async_trait]
impl LLMProvider for Anthropic {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = build_request_body(&request)?;

        let response = self
            .with_default_headers(self.client.post(self.endpoint("messages")))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text)
            .map_err(|e| LLMError::invalid_response(format!("malformed messages reply: {e}")))?;

        parse_response(parsed)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
