use std::env;

use async_trait::async_trait;

use crate::{
    error::LLMError,
    providers::{
        openai::{timeout_from_env, OpenAI, OpenAIConfig, DEFAULT_BASE_URL},
        LLMProvider,
    },
    types::{CompletionRequest, CompletionResponse},
};

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Groq speaks the Chat Completions dialect, so it reuses the OpenAI adapter end to end.
#[derive(Debug, Clone)]
pub struct Groq {
    inner: OpenAI,
}

impl Groq {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        let api_key =
            env::var("GROQ_API_KEY").map_err(|_| LLMError::MissingApiKey("GROQ_API_KEY"))?;
        let mut config = OpenAIConfig::new(api_key);

        if let Ok(base_url) = env::var("GROQ_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        if let Some(timeout) = timeout_from_env("GROQ_REQUEST_TIMEOUT_MS") {
            config = config.with_timeout(timeout);
        }

        Self::from_config(config)
    }

    /// Points the config at Groq unless a base URL other than the OpenAI default was set.
    pub fn from_config(mut config: OpenAIConfig) -> Result<Self, LLMError> {
        if config.base_url == DEFAULT_BASE_URL {
            config.base_url = GROQ_BASE_URL.to_string();
        }
        let inner = OpenAI::from_config(config.with_provider_name("groq"))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl LLMProvider for Groq {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.inner.complete(request).await
    }

    fn name(&self) -> &'static str {
        "groq"
    }
}
