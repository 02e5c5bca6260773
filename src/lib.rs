//! # pricelist-ocr
//!
//! Turn vehicle pricelists into normalised pricing records.
//!
//! ## Why this crate?
//!
//! OEM pricelists arrive as scanned PDFs, photos and spreadsheets, in a dozen
//! languages and with a different column layout per manufacturer. The OCR
//! model that reads the page tables is the easy part. Around it sits the hard
//! part: dispatching pages to an inference engine whose latency ranges from
//! seconds to minutes, running long documents as pollable jobs, recovering
//! from malformed model output, and mapping whatever headers the table has
//! onto one fixed, validated schema.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Document (page images | sheet grids)
//!  │
//!  ├─ 1. Jobs       submit → bounded worker pool → poll / run_sync
//!  ├─ 2. Prepare    decode + smart resize + PNG (spawn_blocking)
//!  ├─ 3. Backend    quantized | full_precision | remote, retry on transient errors
//!  ├─ 4. Repair     malformed JSON → layout cells
//!  ├─ 5. Tables     HTML / sheet grid → header + rows, merged cells expanded
//!  ├─ 6. Mapping    headers → canonical fields (ordered regex rules)
//!  └─ 7. Normalize  numbers, currency, tax → PricelistRecord + page annotations
//! ```
//!
//! Spreadsheets skip steps 2–4.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pricelist_ocr::{
//!     build_backend, load_document, BackendConfig, FieldMapping, Orchestrator,
//!     OrchestratorConfig, ParseOptions, SyncOutcome,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = build_backend(&BackendConfig::default())?;
//!     let mapping = Arc::new(FieldMapping::builtin()?);
//!     let orchestrator = Orchestrator::new(backend, mapping, OrchestratorConfig::default())?;
//!
//!     let document = load_document(Path::new("scans/toyota-2024"))?;
//!     match orchestrator.run_sync(document, ParseOptions::default(), None).await? {
//!         SyncOutcome::Completed { result, .. } => {
//!             println!("{} records", result.records.len());
//!         }
//!         SyncOutcome::Failed { error, .. } => eprintln!("failed: {error}"),
//!         SyncOutcome::Pending { job_id } => eprintln!("still running, poll {job_id}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pricelist-ocr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pricelist-ocr = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing a Backend
//!
//! | Backend | Runs | Good for |
//! |---------|------|----------|
//! | `quantized` | GGUF model behind a local llama.cpp / Ollama server | CPU-only hosts, default |
//! | `full_precision` | local inference command, CPU or GPU | reference output, debugging |
//! | `remote` | OpenAI-compatible server (vLLM, SGLang) | shared GPU, high throughput |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod jobs;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{build_backend, BackendInfo, InferenceBackend, InferenceRequest};
pub use config::{
    BackendConfig, BackendKind, Device, OrchestratorConfig, PageSelection, ParseOptions,
    ParseOptionsBuilder, PromptMode,
};
pub use convert::{parse_document, write_result};
pub use document::{load_document, Document, DocumentKind, MergeRange, Page, Sheet, SheetGrid};
pub use error::{
    BackendError, ErrorDetail, ErrorKind, InputError, MappingError, PageError, PricelistError,
};
pub use jobs::{JobState, JobStatus, Orchestrator, SyncOutcome};
pub use output::{
    Engine, OptionItem, PageReport, PageStatus, ParseResult, ParseStats, Price, PricelistRecord,
    Source, TableReport,
};
pub use pipeline::mapping::{resolve_mapping_file, CanonicalField, FieldMapping};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
