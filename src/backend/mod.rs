//! Inference backends: one image + one prompt in, raw model text out.
//!
//! Three interchangeable engines implement [`InferenceBackend`]:
//!
//! | Kind | Module | Transport |
//! |------|--------|-----------|
//! | `quantized` | [`quantized`] | edgequake-llm provider (llama.cpp / Ollama style server) |
//! | `full_precision` | [`full_precision`] | local subprocess, image passed via a temp file |
//! | `remote` | [`remote`] | OpenAI-compatible `/v1/chat/completions` over HTTP |
//!
//! The backend is picked once from [`BackendConfig`] by [`build_backend`]
//! and shared by every worker; a document is never served by two engines.
//!
//! ## Retry Strategy
//!
//! [`infer_with_retry`] wraps a single call with a per-call timeout and
//! retries only transient failures (timeouts, refused connections, HTTP 429
//! and 5xx). The wait doubles per attempt: with a 500 ms base and one retry
//! a flaky page costs at most half a second of back-off.

pub mod full_precision;
pub mod quantized;
pub mod remote;

use crate::config::{BackendConfig, BackendKind};
use crate::document::PreparedPage;
use crate::error::{BackendError, PageError, PricelistError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

pub use full_precision::FullPrecisionBackend;
pub use quantized::QuantizedBackend;
pub use remote::RemoteBackend;

/// One inference call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// 1-indexed page number, for logging.
    pub page: usize,
    /// Prepared PNG page image.
    pub image: PreparedPage,
    pub prompt: String,
    pub max_pixels: u32,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// What a backend reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// An inference engine. Implementations must be safe to share between workers.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run the model on one page and return its raw text output.
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError>;

    fn describe(&self) -> BackendInfo;
}

/// Instantiate the configured backend.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn InferenceBackend>, PricelistError> {
    let backend: Arc<dyn InferenceBackend> = match config.kind {
        BackendKind::Quantized => Arc::new(QuantizedBackend::from_config(config)?),
        BackendKind::FullPrecision => Arc::new(FullPrecisionBackend::from_config(config)?),
        BackendKind::Remote => Arc::new(RemoteBackend::from_config(config)?),
    };
    debug!("Using inference backend {:?}", backend.describe());
    Ok(backend)
}

/// Outcome of [`infer_with_retry`].
#[derive(Debug)]
pub struct InferenceOutcome {
    pub result: Result<String, PageError>,
    /// Calls made, including the first.
    pub attempts: u32,
}

/// Call the backend with timeout and bounded retry.
///
/// Never returns an error upward: a page that keeps failing yields
/// `PageError::BackendFailed` so sibling pages are unaffected.
pub async fn infer_with_retry(
    backend: &dyn InferenceBackend,
    request: &InferenceRequest,
    max_retries: u32,
    retry_backoff_ms: u64,
    timeout_secs: u64,
) -> InferenceOutcome {
    let page = request.page;
    let mut last_err: Option<BackendError> = None;
    let mut attempts = 0;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = retry_backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
            warn!(
                "Page {}: retry {}/{} after {}ms",
                page, attempt, max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }
        attempts += 1;

        let call = timeout(Duration::from_secs(timeout_secs), backend.infer(request)).await;
        let err = match call {
            Ok(Ok(text)) => {
                debug!("Page {}: {} chars of model output", page, text.len());
                return InferenceOutcome {
                    result: Ok(text),
                    attempts,
                };
            }
            Ok(Err(e)) => e,
            Err(_) => BackendError::Timeout { secs: timeout_secs },
        };

        warn!("Page {}: attempt {} failed: {}", page, attempts, err);
        let transient = err.is_transient();
        last_err = Some(err);
        if !transient {
            break;
        }
    }

    let detail = last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "Unknown error".to_string());
    InferenceOutcome {
        result: Err(PageError::BackendFailed {
            page,
            attempts,
            detail,
        }),
        attempts,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend for unit tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a per-page script; each call pops the next answer.
    /// Pages without a script return `fallback`.
    pub struct ScriptedBackend {
        pub script: Mutex<HashMap<usize, Vec<Result<String, BackendError>>>>,
        pub fallback: String,
        pub calls: Mutex<Vec<usize>>,
        pub delay: Duration,
    }

    impl ScriptedBackend {
        pub fn new(fallback: impl Into<String>) -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                fallback: fallback.into(),
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        pub fn on_page(self, page: usize, answers: Vec<Result<String, BackendError>>) -> Self {
            self.script.lock().unwrap().insert(page, answers);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
            self.calls.lock().unwrap().push(request.page);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let next = {
                let mut script = self.script.lock().unwrap();
                script
                    .get_mut(&request.page)
                    .filter(|answers| !answers.is_empty())
                    .map(|answers| answers.remove(0))
            };
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }

        fn describe(&self) -> BackendInfo {
            BackendInfo {
                kind: BackendKind::Quantized,
                model: "scripted".into(),
                endpoint: None,
                device: None,
            }
        }
    }

    pub fn request(page: usize) -> InferenceRequest {
        InferenceRequest {
            page,
            image: PreparedPage {
                number: page,
                png: vec![0x89, b'P', b'N', b'G'],
                width: 28,
                height: 28,
            },
            prompt: "prompt".into(),
            max_pixels: 1_000_000,
            max_tokens: 4096,
            temperature: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{request, ScriptedBackend};
    use super::*;

    fn refused() -> BackendError {
        BackendError::Connection {
            detail: "refused".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_once_then_succeeds() {
        let backend = ScriptedBackend::new("[]").on_page(1, vec![Err(refused())]);
        let outcome = infer_with_retry(&backend, &request(1), 1, 1, 5).await;
        assert_eq!(outcome.result.unwrap(), "[]");
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let backend = ScriptedBackend::new("[]").on_page(2, vec![Err(refused()), Err(refused())]);
        let outcome = infer_with_retry(&backend, &request(2), 1, 1, 5).await;
        match outcome.result {
            Err(PageError::BackendFailed { page, attempts, .. }) => {
                assert_eq!(page, 2);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let backend = ScriptedBackend::new("[]").on_page(
            1,
            vec![Err(BackendError::Http {
                status: 400,
                body: "bad image".into(),
            })],
        );
        let outcome = infer_with_retry(&backend, &request(1), 3, 1, 5).await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let backend = ScriptedBackend::new("[]").with_delay(Duration::from_millis(1500));
        let outcome = infer_with_retry(&backend, &request(1), 0, 1, 1).await;
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }
}
