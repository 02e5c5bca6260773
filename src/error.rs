//! Error types for the pricelist-ocr library.
//!
//! Errors fall into two families with different blast radius:
//!
//! * [`PricelistError`] is **fatal** to a request or a job. The document
//!   cannot be accepted ([`InputError`]), or cannot be split into pages at
//!   all (`Orchestration`). Returned as `Err(PricelistError)` from
//!   [`crate::jobs::Orchestrator::submit`] and friends, or stored as the
//!   error detail of a failed job.
//!
//! * [`PageError`] is **non-fatal**. One page's backend call failed after
//!   retry, or its model output could not be repaired. Stored inside
//!   [`crate::output::PageReport`] so sibling pages keep their records.
//!
//! Row-level problems (unmapped headers, rows failing validation) are not
//! errors at all: they are counted in the table report.
//!
//! Every user-visible failure carries a machine-readable [`ErrorKind`] and a
//! human-readable detail, bundled as [`ErrorDetail`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputError,
    BackendError,
    RepairExhausted,
    MappingGap,
    ValidationError,
    OrchestrationError,
    ConfigError,
    NotFound,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputError => "input_error",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::RepairExhausted => "repair_exhausted",
            ErrorKind::MappingGap => "mapping_gap",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::OrchestrationError => "orchestration_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{kind, detail}` pair surfaced to callers and serialised into results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// All fatal errors returned by the library.
#[derive(Debug, Error)]
pub enum PricelistError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The document was rejected before any job was created.
    #[error(transparent)]
    Input(#[from] InputError),

    // ── Orchestration errors ──────────────────────────────────────────────
    /// The document could not be split into processable pages at all.
    #[error("Document could not be processed: {detail}")]
    Orchestration { detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The field-mapping rule file could not be loaded.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    // ── Registry errors ───────────────────────────────────────────────────
    /// No job with this identifier is known (never created, or evicted).
    #[error("Job '{job_id}' not found")]
    JobNotFound { job_id: String },

    /// The job exists but is not in a state that allows the operation.
    #[error("Job '{job_id}' is still running")]
    JobNotTerminal { job_id: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not write a result file.
    #[error("Failed to write output to '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PricelistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PricelistError::Input(_) => ErrorKind::InputError,
            PricelistError::Orchestration { .. } => ErrorKind::OrchestrationError,
            PricelistError::InvalidConfig(_) | PricelistError::Mapping(_) => {
                ErrorKind::ConfigError
            }
            PricelistError::JobNotFound { .. } => ErrorKind::NotFound,
            PricelistError::JobNotTerminal { .. } => ErrorKind::InputError,
            PricelistError::OutputWriteFailed { .. } | PricelistError::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

/// The submitted document is unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    /// File extension is not one of pdf / png / jpg / jpeg / xlsx / xls.
    #[error("Unsupported file type '{extension}' for '{file_name}'. Supported: .jpeg, .jpg, .pdf, .png, .xls, .xlsx")]
    UnsupportedFileType { file_name: String, extension: String },

    /// The document has no pages or sheets.
    #[error("Document '{file_name}' is empty")]
    EmptyDocument { file_name: String },

    /// The document content does not match its declared kind.
    #[error("Document '{file_name}' is corrupt: {detail}")]
    CorruptDocument { file_name: String, detail: String },

    /// A local path could not be read.
    #[error("Cannot read '{path}': {detail}")]
    Unreadable { path: String, detail: String },

    /// A raw pdf or workbook was handed to a loader that expects it split.
    #[error("'{file_name}' must be pre-processed: {hint}")]
    NotPreprocessed { file_name: String, hint: String },
}

/// A field-mapping rule file is malformed.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Failed to read mapping file '{path}': {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse mapping YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Mapping rule '{rule}': invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        reason: String,
    },

    #[error("Mapping rule '{rule}': unknown target '{target}'")]
    UnknownTarget { rule: String, target: String },

    #[error("Mapping rule '{rule}' has no patterns")]
    EmptyRule { rule: String },

    #[error("Mapping file '{name}' not found in '{dir}'")]
    NotFound { name: String, dir: String },
}

/// Failure of a single inference call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The call did not finish within the per-call timeout.
    #[error("Inference call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The inference server could not be reached (refused, reset, DNS).
    #[error("Inference server unreachable: {detail}")]
    Connection { detail: String },

    /// The server answered with a non-success status.
    #[error("Inference server returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The local inference process failed.
    #[error("Inference process failed: {detail}")]
    Process { detail: String },

    /// The backend answered but the payload was not usable.
    #[error("Invalid inference response: {detail}")]
    InvalidResponse { detail: String },

    /// The backend was not set up (missing model, provider, endpoint).
    #[error("Backend '{backend}' is not configured: {hint}")]
    NotConfigured { backend: String, hint: String },
}

impl BackendError {
    /// Transient failures are retried; everything else fails the page at once.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout { .. } | BackendError::Connection { .. } => true,
            BackendError::Http { status, .. } => *status == 429 || *status >= 500,
            BackendError::Process { .. }
            | BackendError::InvalidResponse { .. }
            | BackendError::NotConfigured { .. } => false,
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::output::PageReport`]; the job carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageError {
    /// Backend call failed after retry.
    #[error("Page {page}: inference failed after {attempts} attempt(s): {detail}")]
    BackendFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// Model output could not be turned into cells.
    #[error("Page {page}: model output unrecoverable after {attempts} repair attempt(s)")]
    RepairExhausted { page: usize, attempts: u32 },

    /// The page image could not be decoded or resized.
    #[error("Page {page}: preparation failed: {detail}")]
    PreparationFailed { page: usize, detail: String },
}

impl PageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PageError::BackendFailed { .. } => ErrorKind::BackendError,
            PageError::RepairExhausted { .. } => ErrorKind::RepairExhausted,
            PageError::PreparationFailed { .. } => ErrorKind::InputError,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_type_display() {
        let e = InputError::UnsupportedFileType {
            file_name: "prices.docx".into(),
            extension: ".docx".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains(".docx"), "got: {msg}");
        assert!(msg.contains("prices.docx"));
    }

    #[test]
    fn input_error_kind_is_input() {
        let e: PricelistError = InputError::EmptyDocument {
            file_name: "x.pdf".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::InputError);
        assert_eq!(e.detail().kind.as_str(), "input_error");
    }

    #[test]
    fn transient_classification() {
        assert!(BackendError::Timeout { secs: 5 }.is_transient());
        assert!(BackendError::Connection {
            detail: "refused".into()
        }
        .is_transient());
        assert!(BackendError::Http {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(BackendError::Http {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!BackendError::Http {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!BackendError::Process {
            detail: "exit 1".into()
        }
        .is_transient());
    }

    #[test]
    fn page_error_kinds() {
        let e = PageError::BackendFailed {
            page: 2,
            attempts: 2,
            detail: "refused".into(),
        };
        assert_eq!(e.kind(), ErrorKind::BackendError);
        assert!(e.to_string().contains("Page 2"));
        let e = PageError::RepairExhausted {
            page: 3,
            attempts: 3,
        };
        assert_eq!(e.kind(), ErrorKind::RepairExhausted);
    }

    #[test]
    fn error_kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::OrchestrationError).unwrap();
        assert_eq!(json, "\"orchestration_error\"");
    }
}
