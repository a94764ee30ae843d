use async_trait::async_trait;
use serde::{Deserialize, Deserializer};

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod anthropic;
pub mod gemini;
pub mod groq;
pub mod openai;
pub mod scripted;

/// One provider family. Implementations translate the canonical request into their wire format
/// and must return a canonical [`CompletionResponse`]; callers never inspect provider identity.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}

/// Deterministic id for providers that do not assign tool-call ids.
pub(crate) fn synthesize_call_id(request: &CompletionRequest, index: usize) -> String {
    format!("call_{}_{}", request.assistant_turns(), index)
}

/// Reads an explicit JSON `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Turns a non-success HTTP reply into a provider error, preferring the provider's own message.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> LLMError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

    match message {
        Some(message) => LLMError::Provider(message),
        None => LLMError::Provider(format!("unexpected status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_prefers_provider_message() {
        let err = status_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"type":"invalid_request_error","message":"tools.0.name: invalid"}}"#,
        );
        assert_eq!(err.to_string(), "provider error: tools.0.name: invalid");

        let err = status_error(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(
            err.to_string(),
            "provider error: unexpected status 502 Bad Gateway: upstream down"
        );
    }
}
