//! INT4-quantised model behind a local llama.cpp / Ollama style server.
//!
//! The server is reached through an edgequake-llm provider, the same
//! abstraction hosted VLMs use, so swapping the local server for any other
//! vision-capable provider is a config change.

use super::{BackendInfo, InferenceBackend, InferenceRequest};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, PricelistError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::debug;

pub struct QuantizedBackend {
    provider: Arc<dyn LLMProvider>,
    provider_name: String,
    model: String,
}

impl QuantizedBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, PricelistError> {
        if config.model.trim().is_empty() {
            return Err(PricelistError::InvalidConfig(
                "quantized backend needs a model tag".into(),
            ));
        }
        let provider = ProviderFactory::create_llm_provider(&config.provider_name, &config.model)
            .map_err(|e| {
                PricelistError::InvalidConfig(format!(
                    "provider '{}' is not configured: {e}",
                    config.provider_name
                ))
            })?;
        Ok(Self::with_provider(provider, &config.provider_name, &config.model))
    }

    /// Wrap an already-built provider.
    pub fn with_provider(
        provider: Arc<dyn LLMProvider>,
        provider_name: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            provider_name: provider_name.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for QuantizedBackend {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        let messages = vec![ChatMessage::user_with_images(
            request.prompt.as_str(),
            vec![ImageData::new(request.image.to_base64(), "image/png").with_detail("high")],
        )];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify(&e.to_string()))?;
        debug!(
            "Page {}: {} input tokens, {} output tokens",
            request.page, response.prompt_tokens, response.completion_tokens
        );
        if response.content.trim().is_empty() {
            return Err(BackendError::InvalidResponse {
                detail: "empty completion".into(),
            });
        }
        Ok(response.content)
    }

    fn describe(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Quantized,
            model: self.model.clone(),
            endpoint: Some(self.provider_name.clone()),
            device: None,
        }
    }
}

/// Provider errors only expose a message; sort them into retryable or not.
fn classify(message: &str) -> BackendError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        BackendError::Timeout { secs: 0 }
    } else if ["connect", "refused", "reset", "rate limit", "429", "502", "503", "504"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        BackendError::Connection {
            detail: message.to_string(),
        }
    } else {
        BackendError::InvalidResponse {
            detail: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_provider_errors() {
        assert!(classify("connection refused (os error 111)").is_transient());
        assert!(classify("request timed out").is_transient());
        assert!(classify("HTTP 503 Service Unavailable").is_transient());
        assert!(!classify("model does not support images").is_transient());
    }
}
