pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod catalog;
pub mod pricing;
pub mod agent_loop;
pub mod eval;
pub mod config;

pub use error::LLMError;
pub use providers::LLMProvider;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, MessageRole, ModelReply, TokenUsage,
    ToolResult,
};
pub use functions::{
    DynKernelFunction, FunctionCall, FunctionDefinition, FunctionParameter, FunctionParameters,
    FunctionRegistry, KernelFunction, ToolCall, ToolChoice,
};
pub use catalog::{CatalogError, ToolCatalog};
pub use pricing::{ModelPrice, PriceTable, PricingError, UsageAccumulator};
pub use agent_loop::{
    AgentLoop,
    ArgumentPolicy,
    FailureKind,
    LoopConfig,
    LoopGuard,
    RunError,
    RunTrace,
    Termination,
    ToolCallRecord,
};
pub use eval::{
    report::{ProviderSummary, RunOutcome, RunResult},
    runner::{Harness, ProviderEntry, ProviderSource},
    scenario::{Scenario, ScenarioError},
    score::{dedupe, ended_correctly, tool_accuracy, Evaluation},
};
pub use config::{BenchConfig, ConfigError, ProviderKind, ProviderSettings};
