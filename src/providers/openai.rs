use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    functions::{FunctionCall, FunctionDefinition, ToolCall, ToolChoice},
    providers::{status_error, synthesize_call_id, LLMProvider},
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, MessageRole, ModelReply, TokenUsage,
    },
};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub request_timeout: Duration,
    /// Reported by [`LLMProvider::name`]; OpenAI-compatible vendors override it.
    pub provider_name: &'static str,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            request_timeout: Duration::from_secs(60),
            provider_name: "openai",
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

    pub fn with_provider_name(mut self, name: &'static str) -> Self {
        self.provider_name = name;
        self
    }
}

/// Chat Completions adapter. Replies may carry several tool calls at once.
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| LLMError::MissingApiKey("OPENAI_API_KEY"))?;
        let mut config = OpenAIConfig::new(api_key);

        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(org) = env::var("OPENAI_ORGANIZATION") {
            config.organization = Some(org);
        }
        if let Some(timeout) = timeout_from_env("OPENAI_REQUEST_TIMEOUT_MS") {
            config.request_timeout = timeout;
        }

        Self::from_config(config)
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
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
        let mut builder = builder.bearer_auth(&self.config.api_key);

        if let Some(ref org) = self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        builder
    }
}

pub(crate) fn timeout_from_env(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAIRequestBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    choices: Option<Vec<ResponseChoice>>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Compatible endpoints send an explicit `null` when there are no calls.
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn build_request_body(request: &CompletionRequest) -> Result<OpenAIRequestBody, LLMError> {
    let tools = request
        .tools
        .iter()
        .map(wire_tool)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OpenAIRequestBody {
        model: request.model.clone(),
        messages: wire_messages(&request.messages),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        tool_choice: if tools.is_empty() {
            None
        } else {
            request.tool_choice.clone()
        },
        tools: if tools.is_empty() { None } else { Some(tools) },
    })
}

fn wire_tool(definition: &FunctionDefinition) -> Result<WireTool, LLMError> {
    Ok(WireTool {
        kind: "function",
        function: WireFunction {
            name: definition.name.clone(),
            description: definition.description.clone(),
            parameters: definition.parameters_schema()?,
        },
    })
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            // One canonical result turn fans out into one `tool` message per call.
            MessageRole::Tool => {
                for result in &message.tool_results {
                    wire.push(WireMessage {
                        role: "tool",
                        content: Some(result.content()),
                        name: Some(result.name.clone()),
                        tool_call_id: Some(result.call_id.clone()),
                        tool_calls: Vec::new(),
                    });
                }
            }
            MessageRole::Assistant => wire.push(WireMessage {
                role: "assistant",
                content: message.content.clone(),
                name: None,
                tool_call_id: None,
                tool_calls: message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: Some(call.id.clone()),
                        kind: function_kind(),
                        function: WireFunctionCall {
                            name: Some(call.function.name.clone()),
                            arguments: Some(call.function.arguments_json()),
                        },
                    })
                    .collect(),
            }),
            MessageRole::System | MessageRole::User => wire.push(WireMessage {
                role: if message.role == MessageRole::System {
                    "system"
                } else {
                    "user"
                },
                content: Some(message.content.clone().unwrap_or_default()),
                name: None,
                tool_call_id: None,
                tool_calls: Vec::new(),
            }),
        }
    }
    wire
}

pub(crate) fn parse_response(
    request: &CompletionRequest,
    parsed: ChatCompletionResponse,
) -> Result<CompletionResponse, LLMError> {
    let usage = match parsed.usage {
        Some(usage) => TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
        None => {
            tracing::warn!(model = %request.model, "completion reply carried no usage block");
            TokenUsage::default()
        }
    };

    let choice = parsed
        .choices
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or_else(|| LLMError::invalid_response("response did not contain any choices"))?;

    let calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, call)| canonical_call(request, index, call))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompletionResponse {
        reply: ModelReply::from_parts(choice.message.content, calls),
        usage,
    })
}

fn canonical_call(
    request: &CompletionRequest,
    index: usize,
    call: WireToolCall,
) -> Result<ToolCall, LLMError> {
    let name = call
        .function
        .name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| LLMError::invalid_response("tool call missing function name"))?;
    let raw = call.function.arguments.unwrap_or_default();
    let arguments = if raw.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&raw).map_err(|e| {
            LLMError::invalid_response(format!("arguments for `{name}` are not valid json: {e}"))
        })?
    };
    let id = call
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| synthesize_call_id(request, index));

    Ok(ToolCall::new(
        id,
        FunctionCall::new(name, arguments).with_raw_arguments(raw),
    ))
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = build_request_body(&request)?;

        let builder = self
            .with_default_headers(self.client.post(self.endpoint("chat/completions")))
            .json(&body);

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text).map_err(|e| {
            LLMError::invalid_response(format!("malformed chat completion: {e}"))
        })?;

        parse_response(&request, parsed)
    }

    fn name(&self) -> &'static str {
        self.config.provider_name
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::ToolResult;

    fn request() -> CompletionRequest {
        let mut navigate = FunctionDefinition::new("navigate_to_url").with_description("Navigate");
        navigate.add_parameter(crate::functions::FunctionParameter::new(
            "url",
            json!({"type": "string"}),
        ));
        CompletionRequest::new(
            "gpt-4-0125-preview",
            vec![
                ChatMessage::system("You are an RPA bot."),
                ChatMessage::user("Open the shop"),
            ],
        )
        .with_tools(vec![navigate])
        .with_tool_choice(ToolChoice::auto())
    }

    #[test]
    fn body_declares_function_tools() {
        let body = serde_json::to_value(build_request_body(&request()).unwrap()).unwrap();
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "navigate_to_url");
        assert_eq!(
            body["tools"][0]["function"]["parameters"]["required"],
            json!(["url"])
        );
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Open the shop");
    }

    #[test]
    fn result_batch_fans_out_into_tool_messages() {
        let mut request = request();
        let calls = vec![
            ToolCall::new("a", FunctionCall::new("navigate_to_url", json!({"url": "u"}))),
            ToolCall::new("b", FunctionCall::new("extract_text", json!({"selector": "p"}))),
        ];
        request
            .messages
            .push(ChatMessage::assistant_tool_calls(calls, None));
        request.messages.push(ChatMessage::tool_results(vec![
            ToolResult::success("a", "navigate_to_url", json!({"success": true})),
            ToolResult::success("b", "extract_text", json!("text")),
        ]));

        let body = serde_json::to_value(build_request_body(&request).unwrap()).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][1]["function"]["arguments"], r#"{"selector":"p"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "a");
        assert_eq!(messages[3]["content"], r#"{"success":true}"#);
        assert_eq!(messages[4]["content"], r#""text""#);
    }

    #[test]
    fn parses_parallel_tool_calls_in_order() {
        let body: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_x", "type": "function",
                         "function": {"name": "handle_login", "arguments": "{\"url\":\"https://example.com/login\"}"}},
                        {"type": "function",
                         "function": {"name": "navigate_to_url", "arguments": ""}}
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 812, "completion_tokens": 41, "total_tokens": 853}
        }))
        .unwrap();

        let response = parse_response(&request(), body).unwrap();
        assert_eq!(response.usage, TokenUsage::new(812, 41));
        match response.reply {
            ModelReply::ToolCalls { calls, narration } => {
                assert_eq!(narration, None);
                assert_eq!(calls[0].id, "call_x");
                assert_eq!(calls[0].name(), "handle_login");
                assert_eq!(calls[0].function.arguments["url"], "https://example.com/login");
                assert_eq!(calls[1].id, "call_0_1");
                assert_eq!(calls[1].function.arguments, json!({}));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn parses_final_answer() {
        let body: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "Uploaded the specs."}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 4}
        }))
        .unwrap();
        let response = parse_response(&request(), body).unwrap();
        assert_eq!(
            response.reply,
            ModelReply::FinalAnswer {
                text: Some("Uploaded the specs.".into())
            }
        );
    }

    #[test]
    fn null_tool_calls_read_as_final_answer() {
        let body: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"All done.","tool_calls":null}}],
                "usage":{"prompt_tokens":120,"completion_tokens":3}}"#,
        )
        .unwrap();
        let response = parse_response(&request(), body).unwrap();
        assert_eq!(
            response.reply,
            ModelReply::FinalAnswer {
                text: Some("All done.".into())
            }
        );

        let silent: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null,"tool_calls":null}}]}"#,
        )
        .unwrap();
        let response = parse_response(&request(), silent).unwrap();
        assert_eq!(response.reply, ModelReply::FinalAnswer { text: None });
    }

    #[test]
    fn malformed_arguments_are_protocol_errors() {
        let body: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "c", "function": {"name": "extract_text", "arguments": "{selector"}}
            ]}}]
        }))
        .unwrap();
        let err = parse_response(&request(), body).unwrap_err();
        assert!(matches!(err, LLMError::InvalidResponse(_)));

        let empty: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            parse_response(&request(), empty),
            Err(LLMError::InvalidResponse(_))
        ));
    }
}
