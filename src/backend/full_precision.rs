//! Full-precision model run as a local process.
//!
//! Slow (minutes per page on CPU) and only used to debug the quantized
//! model. The runner is invoked as
//!
//! ```text
//! <command...> --image <png> --prompt <text> --max-pixels N --max-tokens N --device D
//! ```
//!
//! and must print the model output on stdout.

use super::{BackendInfo, InferenceBackend, InferenceRequest};
use crate::config::{BackendConfig, BackendKind, Device};
use crate::error::{BackendError, PricelistError};
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub struct FullPrecisionBackend {
    program: String,
    args: Vec<String>,
    model: String,
    device: Device,
}

impl FullPrecisionBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, PricelistError> {
        let (program, args) = config.command.split_first().ok_or_else(|| {
            PricelistError::InvalidConfig("full_precision backend needs a command".into())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            model: config.model.clone(),
            device: config.device,
        })
    }
}

#[async_trait]
impl InferenceBackend for FullPrecisionBackend {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        let process_err = |detail: String| BackendError::Process { detail };

        let mut image = tempfile::Builder::new()
            .prefix("pricelist-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| process_err(format!("tempfile: {e}")))?;
        image
            .write_all(&request.image.png)
            .map_err(|e| process_err(format!("tempfile write: {e}")))?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--image")
            .arg(image.path())
            .arg("--prompt")
            .arg(&request.prompt)
            .arg("--max-pixels")
            .arg(request.max_pixels.to_string())
            .arg("--max-tokens")
            .arg(request.max_tokens.to_string())
            .arg("--device")
            .arg(self.device.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::NotConfigured {
                    backend: BackendKind::FullPrecision.to_string(),
                    hint: format!("runner '{}' not found on PATH", self.program),
                },
                _ => process_err(format!("failed to start '{}': {e}", self.program)),
            })?;
        // `image` is deleted when dropped at the end of this call.

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(process_err(format!("{}: {}", output.status, tail)));
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("Page {}: runner printed {} bytes", request.page, text.len());
        if text.trim().is_empty() {
            return Err(BackendError::InvalidResponse {
                detail: "runner printed nothing".into(),
            });
        }
        Ok(text)
    }

    fn describe(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::FullPrecision,
            model: self.model.clone(),
            endpoint: None,
            device: Some(self.device.to_string()),
        }
    }
}
