use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    functions::{FunctionCall, FunctionDefinition, ToolCall},
    providers::{
        null_as_default, openai::timeout_from_env, status_error, synthesize_call_id, LLMProvider,
    },
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, MessageRole, ModelReply, TokenUsage,
    },
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl GeminiConfig {
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

/// `generateContent` adapter. Gemini assigns no call ids, so they are synthesized per turn.
#[derive(Debug, Clone)]
pub struct Gemini {
    client: Client,
    config: GeminiConfig,
}

impl Gemini {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(GeminiConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        let api_key =
            env::var("GEMINI_API_KEY").map_err(|_| LLMError::MissingApiKey("GEMINI_API_KEY"))?;
        let mut config = GeminiConfig::new(api_key);

        if let Ok(base_url) = env::var("GEMINI_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        if let Some(timeout) = timeout_from_env("GEMINI_REQUEST_TIMEOUT_MS") {
            config = config.with_timeout(timeout);
        }

        Self::from_config(config)
    }

    pub fn from_config(config: GeminiConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentBody {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTools>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default, deserialize_with = "null_as_default")]
    content: Content,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Gemini expects OpenAPI-style upper-case type tags (`OBJECT`, `STRING`) at every level.
pub(crate) fn uppercase_schema_types(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, value)| !(key.as_str() == "additionalProperties" && value.is_boolean()))
                .map(|(key, value)| {
                    let value = match (key.as_str(), value) {
                        ("type", Value::String(kind)) => Value::String(kind.to_uppercase()),
                        _ => uppercase_schema_types(value),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(uppercase_schema_types).collect()),
        other => other.clone(),
    }
}

pub(crate) fn build_request_body(
    request: &CompletionRequest,
) -> Result<GenerateContentBody, LLMError> {
    let declarations = request
        .tools
        .iter()
        .map(declaration)
        .collect::<Result<Vec<_>, _>>()?;

    let system = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .filter_map(ChatMessage::text)
        .map(|text| Part {
            text: Some(text.to_string()),
            ..Part::default()
        })
        .collect::<Vec<_>>();

    let generation_config = (request.max_tokens.is_some() || request.temperature.is_some())
        .then(|| GenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
        });

    Ok(GenerateContentBody {
        contents: wire_contents(&request.messages),
        system_instruction: (!system.is_empty()).then(|| Content {
            role: None,
            parts: system,
        }),
        tools: if declarations.is_empty() {
            Vec::new()
        } else {
            vec![WireTools {
                function_declarations: declarations,
            }]
        },
        generation_config,
    })
}

fn declaration(definition: &FunctionDefinition) -> Result<FunctionDeclaration, LLMError> {
    Ok(FunctionDeclaration {
        name: definition.name.clone(),
        description: definition.description.clone(),
        parameters: uppercase_schema_types(&definition.parameters_schema()?),
    })
}

fn wire_contents(messages: &[ChatMessage]) -> Vec<Content> {
    messages
        .iter()
        .filter_map(|message| {
            let (role, parts) = match message.role {
                MessageRole::System => return None,
                MessageRole::User => (
                    "user",
                    vec![Part {
                        text: Some(message.content.clone().unwrap_or_default()),
                        ..Part::default()
                    }],
                ),
                MessageRole::Assistant => {
                    let mut parts = Vec::new();
                    if let Some(text) = message.text().filter(|t| !t.is_empty()) {
                        parts.push(Part {
                            text: Some(text.to_string()),
                            ..Part::default()
                        });
                    }
                    parts.extend(message.tool_calls.iter().map(|call| Part {
                        function_call: Some(WireFunctionCall {
                            name: call.function.name.clone(),
                            args: call.function.arguments.clone(),
                        }),
                        ..Part::default()
                    }));
                    ("model", parts)
                }
                MessageRole::Tool => (
                    "user",
                    message
                        .tool_results
                        .iter()
                        .map(|result| Part {
                            function_response: Some(WireFunctionResponse {
                                name: result.name.clone(),
                                response: serde_json::json!({
                                    "name": result.name,
                                    "content": result.output,
                                }),
                            }),
                            ..Part::default()
                        })
                        .collect(),
                ),
            };
            Some(Content {
                role: Some(role.to_string()),
                parts,
            })
        })
        .collect()
}

pub(crate) fn parse_response(
    request: &CompletionRequest,
    parsed: GenerateContentResponse,
) -> Result<CompletionResponse, LLMError> {
    let usage = parsed
        .usage_metadata
        .map(|usage| TokenUsage::new(usage.prompt_token_count, usage.candidates_token_count))
        .unwrap_or_default();

    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LLMError::invalid_response("response did not contain any candidates"))?;

    let mut text: Option<String> = None;
    let mut calls = Vec::new();
    for part in candidate.content.parts {
        if let Some(call) = part.function_call {
            let args = if call.args.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                call.args
            };
            let id = synthesize_call_id(request, calls.len());
            calls.push(ToolCall::new(id, FunctionCall::new(call.name, args)));
        } else if let Some(chunk) = part.text {
            match text.as_mut() {
                Some(existing) => existing.push_str(&chunk),
                None => text = Some(chunk),
            }
        }
    }

    Ok(CompletionResponse {
        reply: ModelReply::from_parts(text, calls),
        usage,
    })
}

#[async_trait]
impl LLMProvider for Gemini {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = build_request_body(&request)?;

        let response = self
            .client
            .post(self.endpoint(&request.model))
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| LLMError::invalid_response(format!("malformed generateContent reply: {e}")))?;

        parse_response(&request, parsed)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
