//! LLM provider contract.
//!
//! The core never talks to a provider directly; it calls this trait. A
//! deployment wires a concrete client (HTTP, gRPC, sidecar) at the
//! composition root. Cancellation propagates through the token argument,
//! and failures surface as [`LlmFailure`] taxonomy buckets so the HTTP
//! layer can report them without leaking provider internals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{LlmFailure, ParleQLError, Result};

/// One message of a structured prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    /// "system", "user", or "assistant".
    pub role:    String,
    /// Message content.
    pub content: String,
}

impl LlmMessage {
    /// Build a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role:    "system".to_string(),
            content: content.into(),
        }
    }

    /// Build a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role:    "user".to_string(),
            content: content.into(),
        }
    }

    /// Build an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role:    "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    /// Sampling temperature; providers default when `None`.
    pub temperature: Option<f32>,
    /// Completion token cap.
    pub max_tokens:  Option<u32>,
}

/// Token usage, when the provider reports it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Prompt tokens.
    pub input_tokens:  u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// Provider response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Completion text.
    pub content: String,
    /// Usage, if reported.
    pub usage:   Option<LlmUsage>,
}

/// The LLM provider collaborator.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a structured prompt and await the completion.
    ///
    /// Implementations must observe `cancel`: an aborted request returns
    /// [`ParleQLError::Cancelled`] promptly rather than running to
    /// completion.
    ///
    /// # Errors
    ///
    /// [`ParleQLError::LlmUnavailable`] with the appropriate taxonomy
    /// bucket, or [`ParleQLError::LlmEmpty`] when the completion is blank.
    async fn invoke(
        &self,
        messages: &[LlmMessage],
        options: &LlmOptions,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse>;

    /// Provider name for spans and logs.
    fn name(&self) -> &str;
}

/// A provider that is not configured.
///
/// Dev-mode deployments that only exercise pattern routing and metadata
/// answers can run without a provider; any pipeline path that needs a
/// completion fails with `llm_unavailable`.
pub struct UnconfiguredProvider;

#[async_trait]
impl LlmProvider for UnconfiguredProvider {
    async fn invoke(
        &self,
        _messages: &[LlmMessage],
        _options: &LlmOptions,
        _cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        Err(ParleQLError::llm(
            "no LLM provider configured",
            LlmFailure::Other,
        ))
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_provider_reports_other() {
        let provider = UnconfiguredProvider;
        let err = provider
            .invoke(&[LlmMessage::user("hi")], &LlmOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ParleQLError::LlmUnavailable {
                taxonomy: LlmFailure::Other,
                ..
            }
        ));
    }
}
