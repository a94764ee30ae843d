use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::{synthesize_call_id, LLMProvider},
    types::{CompletionRequest, CompletionResponse, ModelReply, TokenUsage},
    LLMError,
};

/// One canned model reply. A turn with tool calls is a batch; a turn with only text is final.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ScriptedCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCall {
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn call(name: impl Into<String>, arguments: Value) -> Self {
        Self::default().with_call(name, arguments)
    }

    pub fn with_call(mut self, name: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push(ScriptedCall {
            name: name.into(),
            arguments,
        });
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }
}

/// Deterministic provider that replays a fixed script, for offline runs and tests.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::from_scripted_turns(Vec::new())
    }

    pub fn from_scripted_turns(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleeps before every reply; used to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn remaining(&self) -> usize {
        self.turns.lock().await.len()
    }

    /// Every request received so far, in order.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let turn = self
            .turns
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| LLMError::invalid_response("scripted provider ran out of turns"))?;

        let calls = turn
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                ToolCall::new(
                    synthesize_call_id(&request, index),
                    FunctionCall::new(call.name, call.arguments),
                )
            })
            .collect();

        let reply = ModelReply::from_parts(turn.text, calls);
        self.requests.lock().await.push(request);

        Ok(CompletionResponse {
            reply,
            usage: turn.usage,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::ChatMessage;

    #[tokio::test]
    async fn replays_turns_in_order_then_fails() {
        let provider = ScriptedProvider::from_scripted_turns([
            ScriptedTurn::call("navigate_to_url", json!({"url": "https://example.com"}))
                .with_call("extract_text", json!({"selector": "h1"}))
                .with_usage(100, 10),
            ScriptedTurn::text("done").with_usage(120, 3),
        ]);
        let request = CompletionRequest::new("scripted", vec![ChatMessage::user("go")]);

        let first = provider.complete(request.clone()).await.unwrap();
        match first.reply {
            ModelReply::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].id, "call_0_0");
                assert_eq!(calls[1].id, "call_0_1");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(first.usage, TokenUsage::new(100, 10));

        let second = provider.complete(request.clone()).await.unwrap();
        assert!(second.reply.is_final());
        assert_eq!(provider.requests().await.len(), 2);

        let err = provider.complete(request).await.unwrap_err();
        assert!(matches!(err, LLMError::InvalidResponse(_)));
    }

    #[test]
    fn turns_parse_from_yaml() {
        let turns: Vec<ScriptedTurn> = serde_yaml::from_str(
            r#"
- tool_calls:
    - name: handle_login
      arguments: { url: "https://example.com/login" }
  usage: { input_tokens: 10, output_tokens: 2 }
- tool_calls:
    - name: scroll_to_bottom
- text: finished
"#,
        )
        .unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].usage, TokenUsage::new(10, 2));
        assert_eq!(turns[1].tool_calls[0].arguments, json!({}));
        assert_eq!(turns[2].text.as_deref(), Some("finished"));
    }
}
