//! Provider-independent tool-calling loop.
//!
//! A run seeds the transcript with the task prompt, then alternates between asking the model for
//! its next step and executing the tool batch it requested, until the model answers, the loop
//! guard fires on an executed call, or the turn ceiling is reached.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time;

use crate::{
    catalog::ToolCatalog,
    functions::{ToolCall, ToolChoice},
    pricing::UsageAccumulator,
    types::{ChatMessage, CompletionRequest, ModelReply, TokenUsage, ToolResult},
    LLMError, LLMProvider,
};

pub const DEFAULT_MAX_TURNS: usize = 25;
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "model requested unknown tool `{name}`{}",
        .suggestion.as_deref().map(|s| format!(" (did you mean `{s}`?)")).unwrap_or_default()
    )]
    UnknownTool {
        name: String,
        suggestion: Option<String>,
    },
    #[error("provider protocol violation: {0}")]
    ProviderProtocol(String),
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("arguments for `{tool}` violate its schema: {}", .violations.join("; "))]
    InvalidArguments {
        tool: String,
        violations: Vec<String>,
    },
    #[error("provider call timed out after {0:?}")]
    ProviderTimeout(Duration),
    #[error("run exceeded its deadline of {0:?}")]
    RunTimeout(Duration),
    #[error(transparent)]
    Provider(LLMError),
}

impl From<LLMError> for RunError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::UnknownFunction { name, suggestion } => Self::UnknownTool { name, suggestion },
            LLMError::InvalidResponse(message) => Self::ProviderProtocol(message),
            other => Self::Provider(other),
        }
    }
}

/// Serializable classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTool,
    ProviderProtocol,
    InvalidScenario,
    InvalidArguments,
    Timeout,
    Provider,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnknownTool => "unknown_tool",
            Self::ProviderProtocol => "provider_protocol",
            Self::InvalidScenario => "invalid_scenario",
            Self::InvalidArguments => "invalid_arguments",
            Self::Timeout => "timeout",
            Self::Provider => "provider",
        };
        f.write_str(label)
    }
}

impl RunError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownTool { .. } => FailureKind::UnknownTool,
            Self::ProviderProtocol(_) => FailureKind::ProviderProtocol,
            Self::InvalidScenario(_) => FailureKind::InvalidScenario,
            Self::InvalidArguments { .. } => FailureKind::InvalidArguments,
            Self::ProviderTimeout(_) | Self::RunTimeout(_) => FailureKind::Timeout,
            Self::Provider(_) => FailureKind::Provider,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentPolicy {
    /// Record schema violations on the call and invoke anyway.
    #[default]
    Lenient,
    /// Abort the run on the first schema violation.
    Strict,
}

/// Predicate evaluated after every executed call; when it holds the run stops.
#[derive(Clone, Default)]
pub enum LoopGuard {
    #[default]
    None,
    StopAfterTool(String),
    Custom(Arc<dyn Fn(&ToolCall) -> bool + Send + Sync>),
}

impl LoopGuard {
    pub fn stop_after(tool: impl Into<String>) -> Self {
        Self::StopAfterTool(tool.into())
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&ToolCall) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    pub fn trips(&self, call: &ToolCall) -> bool {
        match self {
            Self::None => false,
            Self::StopAfterTool(tool) => call.name() == tool,
            Self::Custom(predicate) => predicate(call),
        }
    }
}

impl fmt::Debug for LoopGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::StopAfterTool(tool) => f.debug_tuple("StopAfterTool").field(tool).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub llm_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub argument_policy: ArgumentPolicy,
    pub guard: LoopGuard,
}

impl LoopConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: None,
            temperature: None,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            run_timeout: None,
            argument_policy: ArgumentPolicy::default(),
            guard: LoopGuard::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Values below one are raised to one.
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_argument_policy(mut self, policy: ArgumentPolicy) -> Self {
        self.argument_policy = policy;
        self
    }

    pub fn with_guard(mut self, guard: LoopGuard) -> Self {
        self.guard = guard;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    FinalAnswer,
    GuardTripped { tool: String },
    MaxTurns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub schema_valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema_errors: Vec<String>,
    /// The tool body failed and the error was reported back to the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// Everything observed during one completed run.
#[derive(Debug, Clone)]
pub struct RunTrace {
    pub tool_calls: Vec<ToolCallRecord>,
    pub final_text: Option<String>,
    pub termination: Termination,
    pub usage: UsageAccumulator,
    /// Remote calls issued.
    pub turns: usize,
    pub narration: Vec<String>,
    pub transcript: Vec<ChatMessage>,
}

impl RunTrace {
    pub fn tools_used(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|call| call.name.as_str()).collect()
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.usage.total()
    }
}

#[derive(Debug, Clone)]
pub struct AgentLoop {
    config: LoopConfig,
}

impl AgentLoop {
    pub fn new(config: LoopConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        provider: &dyn LLMProvider,
        catalog: &ToolCatalog,
        prompt: impl Into<String>,
    ) -> Result<RunTrace, RunError> {
        let run = self.drive(provider, catalog, prompt.into());
        match self.config.run_timeout {
            Some(limit) => time::timeout(limit, run)
                .await
                .map_err(|_| RunError::RunTimeout(limit))?,
            None => run.await,
        }
    }

    async fn drive(
        &self,
        provider: &dyn LLMProvider,
        catalog: &ToolCatalog,
        prompt: String,
    ) -> Result<RunTrace, RunError> {
        let config = &self.config;
        let definitions = catalog.definitions();

        let mut messages = Vec::new();
        if let Some(system) = config.system_prompt.as_deref() {
            if !system.trim().is_empty() {
                messages.push(ChatMessage::system(system));
            }
        }
        messages.push(ChatMessage::user(prompt));

        let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut narration = Vec::new();
        let mut usage = UsageAccumulator::new();
        let mut final_text = None;
        let mut turns = 0;

        tracing::info!(
            provider = provider.name(),
            model = %config.model,
            max_turns = config.max_turns,
            "run started"
        );

        let termination = loop {
            if turns >= config.max_turns {
                tracing::warn!(
                    provider = provider.name(),
                    turns,
                    "turn ceiling reached without a final answer"
                );
                break Termination::MaxTurns;
            }

            let mut request = CompletionRequest::new(config.model.clone(), messages.clone())
                .with_tools(definitions.clone())
                .with_tool_choice(ToolChoice::auto());
            request.max_tokens = config.max_tokens;
            request.temperature = config.temperature;

            turns += 1;
            let response = match time::timeout(config.llm_timeout, provider.complete(request)).await
            {
                Ok(res) => res?,
                Err(_) => return Err(RunError::ProviderTimeout(config.llm_timeout)),
            };
            usage.record(response.usage);

            tracing::debug!(
                provider = provider.name(),
                turn = turns,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                final_answer = response.reply.is_final(),
                "model replied"
            );

            let (mut calls, turn_narration) = match response.reply {
                ModelReply::FinalAnswer { text } => {
                    if let Some(text) = text.as_deref() {
                        messages.push(ChatMessage::assistant(text));
                    }
                    final_text = text;
                    break Termination::FinalAnswer;
                }
                ModelReply::ToolCalls { calls, narration } => (calls, narration),
            };

            if let Some(text) = turn_narration.as_deref() {
                tracing::debug!(provider = provider.name(), narration = %text, "model narration");
                narration.push(text.to_string());
            }

            let mut results = Vec::with_capacity(calls.len());
            let mut tripped = None;
            for (index, call) in calls.iter().enumerate() {
                let violations = catalog.validate(call.name(), &call.function.arguments)?;
                if !violations.is_empty() {
                    if config.argument_policy == ArgumentPolicy::Strict {
                        return Err(RunError::InvalidArguments {
                            tool: call.name().to_string(),
                            violations,
                        });
                    }
                    tracing::warn!(
                        tool = call.name(),
                        violations = ?violations,
                        "tool arguments violate schema"
                    );
                }

                tracing::debug!(tool = call.name(), id = %call.id, "invoking tool");
                let result = match catalog.invoke(&call.function).await {
                    Ok(output) => ToolResult::success(&call.id, call.name(), output),
                    Err(LLMError::FunctionExecution { message, .. }) => {
                        tracing::debug!(tool = call.name(), %message, "tool reported an error");
                        ToolResult::error(&call.id, call.name(), message)
                    }
                    Err(err) => return Err(err.into()),
                };

                tool_calls.push(ToolCallRecord {
                    id: call.id.clone(),
                    name: call.name().to_string(),
                    arguments: call.function.arguments.clone(),
                    schema_valid: violations.is_empty(),
                    schema_errors: violations,
                    is_error: result.is_error,
                });
                results.push(result);

                if config.guard.trips(call) {
                    let skipped = calls.len() - index - 1;
                    if skipped > 0 {
                        tracing::warn!(tool = call.name(), skipped, "skipping rest of tool batch");
                    }
                    tripped = Some(call.name().to_string());
                    break;
                }
            }

            // Only executed calls go into the transcript so every call has a result.
            calls.truncate(results.len());
            messages.push(ChatMessage::assistant_tool_calls(calls, turn_narration));
            messages.push(ChatMessage::tool_results(results));

            if let Some(tool) = tripped {
                tracing::warn!(provider = provider.name(), %tool, "loop guard tripped");
                break Termination::GuardTripped { tool };
            }
        };

        tracing::info!(
            provider = provider.name(),
            model = %config.model,
            turns,
            tool_calls = tool_calls.len(),
            termination = ?termination,
            "run finished"
        );

        Ok(RunTrace {
            tool_calls,
            final_text,
            termination,
            usage,
            turns,
            narration,
            transcript: messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedTurn};
    use crate::types::MessageRole;

    fn catalog() -> ToolCatalog {
        ToolCatalog::builtin().unwrap()
    }

    #[tokio::test]
    async fn runs_tool_batches_until_final_answer() {
        let provider = ScriptedProvider::from_scripted_turns([
            ScriptedTurn::call("navigate_to_url", json!({"url": "https://example.com/shop"}))
                .with_usage(500, 20),
            ScriptedTurn::call("extract_text", json!({"selector": ".product"}))
                .with_call("take_screenshot", json!({"filename": "shop.png"}))
                .with_usage(600, 30),
            ScriptedTurn::text("Three products found.").with_usage(700, 10),
        ]);
        let agent = AgentLoop::new(LoopConfig::new("scripted").with_system_prompt("Use tools."));

        let trace = agent.run(&provider, &catalog(), "List products").await.unwrap();

        assert_eq!(trace.termination, Termination::FinalAnswer);
        assert_eq!(trace.final_text.as_deref(), Some("Three products found."));
        assert_eq!(
            trace.tools_used(),
            ["navigate_to_url", "extract_text", "take_screenshot"]
        );
        assert_eq!(trace.turns, 3);
        assert_eq!(trace.total_usage(), TokenUsage::new(1800, 60));

        let roles: Vec<_> = trace.transcript.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant,
            ]
        );
        let second_results = &trace.transcript[5].tool_results;
        assert_eq!(second_results.len(), 2);
        assert_eq!(
            second_results[0].output,
            json!("Product1: $23, Product2: $23, Product3: $232")
        );

        // Third request saw the full history including both result turns.
        let requests = provider.requests().await;
        assert_eq!(requests[2].messages.len(), 6);
        assert_eq!(requests[0].tools.len(), 30);
    }

    #[tokio::test]
    async fn guard_stops_run_and_skips_rest_of_batch() {
        let provider = ScriptedProvider::from_scripted_turns([
            ScriptedTurn::call("navigate_to_url", json!({"url": "https://example.com"}))
                .with_call("upload_to_file_server", json!({"content": "specs"}))
                .with_call("navigate_to_url", json!({"url": "https://example.com/again"})),
            ScriptedTurn::text("never requested"),
        ]);
        let agent = AgentLoop::new(
            LoopConfig::new("scripted").with_guard(LoopGuard::stop_after("upload_to_file_server")),
        );

        let trace = agent.run(&provider, &catalog(), "Upload").await.unwrap();

        assert_eq!(
            trace.termination,
            Termination::GuardTripped {
                tool: "upload_to_file_server".into()
            }
        );
        assert_eq!(trace.tools_used(), ["navigate_to_url", "upload_to_file_server"]);
        assert_eq!(trace.final_text, None);
        assert_eq!(trace.turns, 1);
        assert_eq!(provider.remaining().await, 1);
        let last_batch = &trace.transcript[trace.transcript.len() - 2];
        assert_eq!(last_batch.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn custom_guard_predicate_is_honoured() {
        let provider = ScriptedProvider::from_scripted_turns([
            ScriptedTurn::call("scroll_to_bottom", json!({})),
            ScriptedTurn::call("scroll_to_bottom", json!({})),
        ]);
        let agent = AgentLoop::new(
            LoopConfig::new("scripted")
                .with_guard(LoopGuard::custom(|call| call.id.starts_with("call_1"))),
        );
        let trace = agent.run(&provider, &catalog(), "Scroll").await.unwrap();
        assert_eq!(trace.turns, 2);
        assert!(matches!(trace.termination, Termination::GuardTripped { .. }));
    }

    #[tokio::test]
    async fn turn_ceiling_ends_run_without_final_text() {
        let provider = ScriptedProvider::from_scripted_turns(
            (0..5).map(|_| ScriptedTurn::call("scroll_to_bottom", json!({}))),
        );
        let agent = AgentLoop::new(LoopConfig::new("scripted").with_max_turns(3));

        let trace = agent.run(&provider, &catalog(), "Scroll forever").await.unwrap();

        assert_eq!(trace.termination, Termination::MaxTurns);
        assert_eq!(trace.turns, 3);
        assert_eq!(trace.final_text, None);
        assert_eq!(trace.tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn unknown_tool_aborts_with_suggestion() {
        let provider = ScriptedProvider::from_scripted_turns([ScriptedTurn::call(
            "navigate_to_ur",
            json!({"url": "https://example.com"}),
        )]);
        let agent = AgentLoop::new(LoopConfig::new("scripted"));

        let err = agent.run(&provider, &catalog(), "Go").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnknownTool);
        assert!(matches!(
            err,
            RunError::UnknownTool { ref suggestion, .. } if suggestion.as_deref() == Some("navigate_to_url")
        ));
    }

    #[tokio::test]
    async fn argument_policy_controls_schema_violations() {
        let script = || {
            ScriptedProvider::from_scripted_turns([
                ScriptedTurn::call("navigate_to_url", json!({"link": "https://example.com"})),
                ScriptedTurn::text("done"),
            ])
        };

        let lenient = AgentLoop::new(LoopConfig::new("scripted"));
        let trace = lenient.run(&script(), &catalog(), "Go").await.unwrap();
        assert!(!trace.tool_calls[0].schema_valid);
        assert!(!trace.tool_calls[0].schema_errors.is_empty());
        assert_eq!(trace.final_text.as_deref(), Some("done"));

        let strict = AgentLoop::new(
            LoopConfig::new("scripted").with_argument_policy(ArgumentPolicy::Strict),
        );
        let err = strict.run(&script(), &catalog(), "Go").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidArguments);
    }

    #[tokio::test]
    async fn tool_errors_are_fed_back_to_the_model() {
        let catalog = ToolCatalog::from_yaml_str(
            r#"
tools:
  - name: solve_captcha
    default: { kind: err, message: captcha service unavailable }
"#,
        )
        .unwrap();
        let provider = ScriptedProvider::from_scripted_turns([
            ScriptedTurn::call("solve_captcha", json!({})),
            ScriptedTurn::text("Could not solve the captcha."),
        ]);
        let agent = AgentLoop::new(LoopConfig::new("scripted"));

        let trace = agent.run(&provider, &catalog, "Solve").await.unwrap();
        assert!(trace.tool_calls[0].is_error);
        let result = &trace.transcript[2].tool_results[0];
        assert!(result.is_error);
        assert_eq!(result.output, json!({"error": "captcha service unavailable"}));
        assert_eq!(trace.termination, Termination::FinalAnswer);
    }

    #[tokio::test]
    async fn slow_provider_hits_call_deadline() {
        let provider = ScriptedProvider::from_scripted_turns([ScriptedTurn::text("late")])
            .with_delay(Duration::from_millis(200));
        let agent =
            AgentLoop::new(LoopConfig::new("scripted").with_llm_timeout(Duration::from_millis(10)));

        let err = agent.run(&provider, &catalog(), "Hurry").await.unwrap_err();
        assert!(matches!(err, RunError::ProviderTimeout(_)));
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[tokio::test]
    async fn run_deadline_bounds_many_fast_turns() {
        let provider = ScriptedProvider::from_scripted_turns(
            (0..10).map(|_| ScriptedTurn::call("scroll_to_bottom", json!({}))),
        )
        .with_delay(Duration::from_millis(30));
        let agent = AgentLoop::new(
            LoopConfig::new("scripted")
                .with_llm_timeout(Duration::from_millis(500))
                .with_run_timeout(Duration::from_millis(100)),
        );

        let err = agent.run(&provider, &catalog(), "Scroll").await.unwrap_err();
        assert!(matches!(err, RunError::RunTimeout(limit) if limit == Duration::from_millis(100)));
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(provider.remaining().await > 0);
    }

    #[tokio::test]
    async fn silent_final_turn_completes_without_text() {
        let provider = ScriptedProvider::from_scripted_turns([
            ScriptedTurn::call("navigate_to_url", json!({"url": "https://example.com"})),
            ScriptedTurn::default(),
        ]);
        let agent = AgentLoop::new(LoopConfig::new("scripted"));

        let trace = agent.run(&provider, &catalog(), "Go").await.unwrap();
        assert_eq!(trace.termination, Termination::FinalAnswer);
        assert_eq!(trace.final_text, None);
        assert_eq!(trace.tools_used(), ["navigate_to_url"]);
        assert_eq!(trace.transcript.last().unwrap().role, MessageRole::Tool);
    }

    #[tokio::test]
    async fn exhausted_script_is_a_protocol_error() {
        let provider = ScriptedProvider::new();
        let agent = AgentLoop::new(LoopConfig::new("scripted"));
        let err = agent.run(&provider, &catalog(), "Anything").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProviderProtocol);
    }
}
