//! Configuration types for pricelist extraction.
//!
//! Three layers, each with a different lifetime:
//!
//! * [`BackendConfig`]: chosen once per process. Selects which inference
//!   engine serves every page of every job; backends are never mixed
//!   within a document.
//! * [`OrchestratorConfig`]: worker pool size and job retention.
//! * [`ParseOptions`]: set per submitted document. Pixel and token budgets,
//!   prompt mode, retry policy, page selection, mapping override.
//!
//! `ParseOptions` is built through [`ParseOptionsBuilder`] so callers set
//! only what they care about and rely on documented defaults for the rest.

use crate::error::PricelistError;
use crate::pipeline::mapping::FieldMapping;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Lower bound of the per-page pixel budget.
pub const MIN_PIXELS: u32 = 3_136;
/// Default pixel budget (~1 300 visual tokens, fast enough on CPU).
pub const DEFAULT_MAX_PIXELS: u32 = 1_000_000;
/// Full-resolution pixel budget for high-fidelity runs.
pub const MAX_PIXELS_FULL: u32 = 11_289_600;
/// Resized page dimensions are multiples of this.
pub const IMAGE_FACTOR: u32 = 28;

/// Per-document options.
///
/// Built via [`ParseOptions::builder()`] or using [`ParseOptions::default()`].
///
/// # Example
/// ```rust
/// use pricelist_ocr::{ParseOptions, PromptMode};
///
/// let options = ParseOptions::builder()
///     .max_pixels(1_500_000)
///     .prompt_mode(PromptMode::TablesOnly)
///     .max_tokens(8192)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ParseOptions {
    /// Upper bound on pixels per page image. Default: 1 000 000.
    ///
    /// Pages larger than this are downscaled before inference. Visual token
    /// count grows linearly with pixels, and so does CPU latency; dense
    /// small-font pricelists may need 2–3 M.
    pub max_pixels: u32,

    /// Lower bound on pixels per page image. Default: 3 136.
    pub min_pixels: u32,

    /// Which prompt to send with each page. Default: [`PromptMode::LayoutAll`].
    pub prompt_mode: PromptMode,

    /// Custom prompt text. If None, uses the built-in prompt for `prompt_mode`.
    pub system_prompt: Option<String>,

    /// Maximum tokens the model may generate per page. Default: 4096.
    ///
    /// Output that hits this cap is cut mid-token; the repair stage recovers
    /// what it can and flags the page `partial`.
    pub max_tokens: usize,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Retries after a transient backend failure. Default: 1.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubling per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-inference-call timeout in seconds. Default: 300.
    pub api_timeout_secs: u64,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Rule set override for this document. If None, the orchestrator's
    /// shared rule set is used.
    pub mapping: Option<Arc<FieldMapping>>,

    /// Optional progress callback for per-page events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
            min_pixels: MIN_PIXELS,
            prompt_mode: PromptMode::default(),
            system_prompt: None,
            max_tokens: 4096,
            temperature: 0.1,
            max_retries: 1,
            retry_backoff_ms: 500,
            api_timeout_secs: 300,
            pages: PageSelection::default(),
            mapping: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ParseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseOptions")
            .field("max_pixels", &self.max_pixels)
            .field("min_pixels", &self.min_pixels)
            .field("prompt_mode", &self.prompt_mode)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("pages", &self.pages)
            .field("mapping", &self.mapping.as_ref().map(|m| m.len()))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl ParseOptions {
    /// Create a new builder for `ParseOptions`.
    pub fn builder() -> ParseOptionsBuilder {
        ParseOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Check the numeric budgets. The fields are public, so options built
    /// without the builder are checked again on submission.
    pub fn validate(&self) -> Result<(), PricelistError> {
        if !(250_000..=11_300_000).contains(&self.max_pixels) {
            return Err(PricelistError::InvalidConfig(format!(
                "max_pixels must be 250000–11300000, got {}",
                self.max_pixels
            )));
        }
        if self.min_pixels == 0 || self.min_pixels > self.max_pixels {
            return Err(PricelistError::InvalidConfig(format!(
                "min_pixels must be 1–{}, got {}",
                self.max_pixels, self.min_pixels
            )));
        }
        if !(256..=32_768).contains(&self.max_tokens) {
            return Err(PricelistError::InvalidConfig(format!(
                "max_tokens must be 256–32768, got {}",
                self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Builder for [`ParseOptions`].
#[derive(Debug)]
pub struct ParseOptionsBuilder {
    options: ParseOptions,
}

impl ParseOptionsBuilder {
    pub fn max_pixels(mut self, px: u32) -> Self {
        self.options.max_pixels = px;
        self
    }

    pub fn min_pixels(mut self, px: u32) -> Self {
        self.options.min_pixels = px;
        self
    }

    pub fn prompt_mode(mut self, mode: PromptMode) -> Self {
        self.options.prompt_mode = mode;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.options.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.options.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.options.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.options.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.options.api_timeout_secs = secs.max(1);
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.options.pages = selection;
        self
    }

    pub fn mapping(mut self, mapping: Arc<FieldMapping>) -> Self {
        self.options.mapping = Some(mapping);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.options.progress_callback = Some(cb);
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<ParseOptions, PricelistError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Prompt-mode identifier sent to every backend.
///
/// Serialised with the identifiers used on the wire (`prompt_layout_all_en`,
/// `prompt_table_html`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PromptMode {
    /// Every layout element; tables as HTML. (default)
    #[default]
    #[serde(rename = "prompt_layout_all_en")]
    LayoutAll,
    /// Tables only; cheaper on dense pages.
    #[serde(rename = "prompt_table_html")]
    TablesOnly,
}

impl PromptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptMode::LayoutAll => "prompt_layout_all_en",
            PromptMode::TablesOnly => "prompt_table_html",
        }
    }
}

impl FromStr for PromptMode {
    type Err = PricelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "prompt_layout_all_en" | "layout" | "layout_all" => Ok(PromptMode::LayoutAll),
            "prompt_table_html" | "tables" | "tables_only" => Ok(PromptMode::TablesOnly),
            other => Err(PricelistError::InvalidConfig(format!(
                "unknown prompt mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specifies which pages of a document to process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

impl FromStr for PageSelection {
    type Err = PricelistError;

    /// Parse `all`, `3`, `2-5` or `1,3,7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || PricelistError::InvalidConfig(format!("invalid page selection '{s}'"));
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }
        if let Some((a, b)) = s.split_once('-') {
            let a = a.trim().parse().map_err(|_| bad())?;
            let b = b.trim().parse().map_err(|_| bad())?;
            return Ok(PageSelection::Range(a, b));
        }
        if s.contains(',') {
            let pages = s
                .split(',')
                .map(|p| p.trim().parse::<usize>().map_err(|_| bad()))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PageSelection::Set(pages));
        }
        s.parse().map(PageSelection::Single).map_err(|_| bad())
    }
}

// ── Backend selection ────────────────────────────────────────────────────

/// Which inference engine serves the pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// INT4-quantised model behind a local llama.cpp-style server. (default)
    #[default]
    Quantized,
    /// Full-precision model run as a local process; slow, used for debugging.
    FullPrecision,
    /// Separate long-running accelerated inference server (vLLM-style).
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Quantized => "quantized",
            BackendKind::FullPrecision => "full_precision",
            BackendKind::Remote => "remote",
        }
    }
}

impl FromStr for BackendKind {
    type Err = PricelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quantized" | "gguf" => Ok(BackendKind::Quantized),
            "full_precision" | "full" | "hf" => Ok(BackendKind::FullPrecision),
            "remote" | "vllm" => Ok(BackendKind::Remote),
            other => Err(PricelistError::InvalidConfig(format!(
                "unknown backend '{other}' (expected quantized, full_precision or remote)"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute device for the full-precision backend. Always explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
    Mps,
}

impl FromStr for Device {
    type Err = PricelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "mps" => Ok(Device::Mps),
            "cuda" => Ok(Device::Cuda(0)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| PricelistError::InvalidConfig(format!("unknown device '{s}'"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(n) => write!(f, "cuda:{n}"),
            Device::Mps => f.write_str("mps"),
        }
    }
}

/// Process-wide backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Model identifier. For the quantized backend this is the model tag the
    /// local server knows (e.g. `dots-ocr:q4_k_m`); for remote, the served
    /// model name.
    pub model: String,

    /// edgequake-llm provider name used by the quantized backend. Default: `ollama`.
    pub provider_name: String,

    /// Base URL of the remote inference server. Default: `http://127.0.0.1:8000`.
    pub endpoint: String,

    /// Optional bearer token for the remote server.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Device for the full-precision backend.
    pub device: Device,

    /// Program and leading arguments of the full-precision runner. The
    /// backend appends `--image`, `--prompt`, `--max-pixels`,
    /// `--max-tokens` and `--device`.
    pub command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            model: "dots-ocr:q4_k_m".to_string(),
            provider_name: "ollama".to_string(),
            endpoint: "http://127.0.0.1:8000".to_string(),
            api_key: None,
            device: Device::default(),
            command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "dots_ocr.infer".to_string(),
            ],
        }
    }
}

/// Worker pool and job retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Jobs processed concurrently. Default: 2.
    pub workers: usize,
    /// Jobs retained in the registry before terminal ones are evicted. Default: 100.
    pub max_jobs: usize,
    /// Default wait for synchronous requests in seconds. Default: 120.
    pub sync_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_jobs: 100,
            sync_timeout_secs: 120,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), PricelistError> {
        if self.workers == 0 {
            return Err(PricelistError::InvalidConfig("workers must be ≥ 1".into()));
        }
        if self.max_jobs == 0 {
            return Err(PricelistError::InvalidConfig("max_jobs must be ≥ 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let o = ParseOptions::builder().build().unwrap();
        assert_eq!(o.max_pixels, DEFAULT_MAX_PIXELS);
        assert_eq!(o.max_tokens, 4096);
        assert_eq!(o.max_retries, 1);
        assert_eq!(o.prompt_mode, PromptMode::LayoutAll);
    }

    #[test]
    fn rejects_out_of_range_pixels() {
        let err = ParseOptions::builder().max_pixels(100).build().unwrap_err();
        assert!(err.to_string().contains("max_pixels"));
    }

    #[test]
    fn rejects_out_of_range_tokens() {
        assert!(ParseOptions::builder().max_tokens(10).build().is_err());
        assert!(ParseOptions::builder().max_tokens(40_000).build().is_err());
    }

    #[test]
    fn literal_options_are_validated() {
        let o = ParseOptions {
            max_pixels: 0,
            ..ParseOptions::default()
        };
        assert!(o.validate().is_err());
        let o = ParseOptions {
            min_pixels: DEFAULT_MAX_PIXELS + 1,
            ..ParseOptions::default()
        };
        assert!(o.validate().is_err());
        assert!(ParseOptions::default().validate().is_ok());
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 4).to_indices(5), vec![1, 2, 3]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3]).to_indices(5), vec![0, 2]);
    }

    #[test]
    fn page_selection_parse() {
        assert!(matches!("all".parse::<PageSelection>().unwrap(), PageSelection::All));
        assert!(matches!("2".parse::<PageSelection>().unwrap(), PageSelection::Single(2)));
        assert!(matches!(
            "2-4".parse::<PageSelection>().unwrap(),
            PageSelection::Range(2, 4)
        ));
        match "1,3".parse::<PageSelection>().unwrap() {
            PageSelection::Set(v) => assert_eq!(v, vec![1, 3]),
            other => panic!("unexpected {other:?}"),
        }
        assert!("x-y".parse::<PageSelection>().is_err());
    }

    #[test]
    fn backend_kind_aliases() {
        assert_eq!("gguf".parse::<BackendKind>().unwrap(), BackendKind::Quantized);
        assert_eq!("hf".parse::<BackendKind>().unwrap(), BackendKind::FullPrecision);
        assert_eq!("vLLM".parse::<BackendKind>().unwrap(), BackendKind::Remote);
        assert!("tpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn device_parse_and_display() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
        assert!("gpu".parse::<Device>().is_err());
    }

    #[test]
    fn prompt_mode_wire_names() {
        assert_eq!(
            "prompt_table_html".parse::<PromptMode>().unwrap(),
            PromptMode::TablesOnly
        );
        assert_eq!(
            serde_json::to_string(&PromptMode::LayoutAll).unwrap(),
            "\"prompt_layout_all_en\""
        );
    }
}
