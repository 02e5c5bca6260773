//! Separate accelerated inference server speaking the OpenAI chat API.
//!
//! A vLLM-style server is started once, outside this process, and serves
//! `POST {endpoint}/v1/chat/completions`. The page goes in as a base64
//! `image_url` data URI; the pixel budget is forwarded through
//! `mm_processor_kwargs` so the server resizes consistently with us.

use super::{BackendInfo, InferenceBackend, InferenceRequest};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, PricelistError};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Longest error body kept in a `BackendError::Http`.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug)]
pub struct RemoteBackend {
    client: reqwest::Client,
    url: String,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl RemoteBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, PricelistError> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(PricelistError::InvalidConfig(format!(
                "remote endpoint must be an http(s) URL, got '{}'",
                config.endpoint
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PricelistError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{endpoint}/v1/chat/completions"),
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn body(&self, request: &InferenceRequest) -> serde_json::Value {
        let data_url = format!("data:image/png;base64,{}", request.image.to_base64());
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": data_url } },
                    { "type": "text", "text": request.prompt },
                ]
            }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "mm_processor_kwargs": { "max_pixels": request.max_pixels },
        })
    }
}

#[async_trait]
impl InferenceBackend for RemoteBackend {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        let mut call = self.client.post(&self.url).json(&self.body(request));
        if let Some(ref key) = self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body: clip(&body),
            });
        }

        let payload: serde_json::Value = response.json().await.map_err(|e| {
            BackendError::InvalidResponse {
                detail: e.to_string(),
            }
        })?;
        let content = extract_content(&payload)?;
        debug!("Page {}: server returned {} chars", request.page, content.len());
        Ok(content)
    }

    fn describe(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Remote,
            model: self.model.clone(),
            endpoint: Some(self.endpoint.clone()),
            device: None,
        }
    }
}

/// First [`MAX_ERROR_BODY`] characters of an error body.
fn clip(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout { secs: 0 }
    } else {
        BackendError::Connection {
            detail: e.to_string(),
        }
    }
}

/// Pull `choices[0].message.content` out of a chat-completions payload.
fn extract_content(payload: &serde_json::Value) -> Result<String, BackendError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackendError::InvalidResponse {
            detail: "no choices[0].message.content in response".into(),
        })
}
