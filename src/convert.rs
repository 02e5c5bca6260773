//! Whole-document extraction.
//!
//! [`parse_document`] runs one document start to finish on the calling
//! task: pages (or sheets) are processed strictly in order so progress is
//! monotonic and records come out in page order. The job orchestrator runs
//! the same code on its workers, observing each page as it finishes; call
//! this directly when you want a result without a job registry.

use crate::backend::{infer_with_retry, InferenceBackend, InferenceRequest};
use crate::config::ParseOptions;
use crate::document::{prepare_page_async, Document, DocumentKind, Page};
use crate::error::PricelistError;
use crate::output::{PageReport, ParseResult, PricelistRecord};
use crate::pipeline::mapping::FieldMapping;
use crate::pipeline::page::{self, PageOutput};
use crate::prompts::prompt_text;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extract pricelist records from a document.
///
/// # Returns
/// `Ok(ParseResult)` whenever at least the page split succeeded, even if
/// every page then failed (see `result.stats.failed_pages`).
///
/// # Errors
/// Only fatal errors:
/// - the page selection matches no page
/// - no page image could be decoded at all
pub async fn parse_document(
    document: &Document,
    backend: &dyn InferenceBackend,
    mapping: &FieldMapping,
    options: &ParseOptions,
) -> Result<ParseResult, PricelistError> {
    let run = run_document(document, backend, mapping, options, "-", &Unobserved).await?;
    Ok(run.result)
}

/// Write a result as pretty JSON. Atomic: temp file + rename.
pub async fn write_result(result: &ParseResult, path: &Path) -> Result<(), PricelistError> {
    let write_err = |source: std::io::Error| PricelistError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(result)
        .map_err(|e| PricelistError::Internal(format!("serialise result: {e}")))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}

// ── Shared with the job workers ──────────────────────────────────────────

/// Hooks a worker uses to publish progress and receive cancellation.
pub(crate) trait RunObserver: Send + Sync {
    fn on_start(&self, _total_pages: usize) {}

    fn on_page(&self, _report: &PageReport) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

struct Unobserved;

impl RunObserver for Unobserved {}

pub(crate) struct RunOutcome {
    pub result: ParseResult,
    /// The run stopped early on request; `result` holds the finished pages.
    pub cancelled: bool,
}

pub(crate) async fn run_document(
    document: &Document,
    backend: &dyn InferenceBackend,
    mapping: &FieldMapping,
    options: &ParseOptions,
    job_id: &str,
    observer: &dyn RunObserver,
) -> Result<RunOutcome, PricelistError> {
    let started = Instant::now();
    let file_name = document.file_name();
    let total_pages = document.page_count();

    // ── Step 1: Select pages ─────────────────────────────────────────────
    let indices = options.pages.to_indices(total_pages);
    if indices.is_empty() {
        return Err(PricelistError::Orchestration {
            detail: format!(
                "page selection {:?} matches none of the {} page(s)",
                options.pages, total_pages
            ),
        });
    }
    let selected = indices.len();
    info!(
        "Job {}: '{}' ({}), {} of {} page(s)",
        job_id,
        file_name,
        document.kind(),
        selected,
        total_pages
    );
    observer.on_start(selected);
    if let Some(ref cb) = options.progress_callback {
        cb.on_job_start(job_id, selected);
    }

    let mut reports: Vec<PageReport> = Vec::with_capacity(selected);
    let mut records: Vec<PricelistRecord> = Vec::new();
    let mut cancelled = false;

    let mut finish_page = |out: PageOutput, page_started: Instant| {
        let mut report = out.report;
        report.duration_ms = page_started.elapsed().as_millis() as u64;
        if let Some(ref cb) = options.progress_callback {
            cb.on_page_complete(job_id, report.page, selected, report.status, report.records);
        }
        observer.on_page(&report);
        records.extend(out.records);
        reports.push(report);
    };

    if document.kind() == DocumentKind::Spreadsheet {
        // ── Step 2a: Sheets map directly ─────────────────────────────────
        for idx in indices {
            if observer.is_cancelled() {
                cancelled = true;
                break;
            }
            let page_started = Instant::now();
            let number = idx + 1;
            if let Some(ref cb) = options.progress_callback {
                cb.on_page_start(job_id, number, selected);
            }
            let sheet = &document.sheets()[idx];
            finish_page(page::from_sheet(sheet, file_name, number, mapping), page_started);
        }
    } else {
        // ── Step 2b: Prepare and infer, one page at a time ───────────────
        // Each image is decoded right before its inference, so only one
        // prepared page is held at a time and cancellation is seen between
        // preparations.
        let prompt = prompt_text(options.prompt_mode, options.system_prompt.as_deref());
        let mut any_prepared = false;
        let mut first_failure: Option<String> = None;
        for idx in indices {
            if observer.is_cancelled() {
                cancelled = true;
                break;
            }
            let page_started = Instant::now();
            let number = idx + 1;
            if let Some(ref cb) = options.progress_callback {
                cb.on_page_start(job_id, number, selected);
            }

            let page: Page = document.pages()[idx].clone();
            let image = match prepare_page_async(page, options.min_pixels, options.max_pixels).await? {
                Ok(image) => {
                    any_prepared = true;
                    image
                }
                Err(e) => {
                    first_failure.get_or_insert_with(|| e.to_string());
                    finish_page(
                        PageOutput {
                            report: PageReport::failed(number, None, e.detail()),
                            records: Vec::new(),
                        },
                        page_started,
                    );
                    continue;
                }
            };
            let request = InferenceRequest {
                page: number,
                image,
                prompt: prompt.to_string(),
                max_pixels: options.max_pixels,
                max_tokens: options.max_tokens,
                temperature: options.temperature,
            };
            let outcome = infer_with_retry(
                backend,
                &request,
                options.max_retries,
                options.retry_backoff_ms,
                options.api_timeout_secs,
            )
            .await;

            let out = match outcome.result {
                Ok(raw) => page::from_model_output(&raw, file_name, number, mapping, outcome.attempts),
                Err(e) => {
                    warn!("Job {}: {}", job_id, e);
                    let mut report = PageReport::failed(number, None, e.detail());
                    report.attempts = outcome.attempts;
                    PageOutput {
                        report,
                        records: Vec::new(),
                    }
                }
            };
            finish_page(out, page_started);
        }
        if !any_prepared && !cancelled {
            if let Some(first) = first_failure {
                return Err(PricelistError::Orchestration {
                    detail: format!("no page of '{file_name}' could be prepared: {first}"),
                });
            }
        }
    }

    // ── Step 3: Assemble ─────────────────────────────────────────────────
    let result = ParseResult::assemble(
        file_name.to_string(),
        document.kind(),
        total_pages,
        records,
        reports,
        started.elapsed().as_millis() as u64,
    );
    debug!("Job {}: {:?}", job_id, result.stats);
    info!(
        "Job {}: {} record(s), {}/{} page(s) ok, {} failed, {}ms{}",
        job_id,
        result.stats.records,
        result.stats.ok_pages,
        result.stats.attempted_pages,
        result.stats.failed_pages,
        result.stats.duration_ms,
        if cancelled { " (cancelled)" } else { "" }
    );
    if let Some(ref cb) = options.progress_callback {
        cb.on_job_complete(job_id, result.stats.records, result.stats.failed_pages);
    }

    Ok(RunOutcome { result, cancelled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::document::Sheet;
    use crate::error::{BackendError, ErrorKind};
    use crate::output::PageStatus;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TABLE_PAGE: &str = r#"[{"category":"Table","text":"<table><tr><th>Model</th><th>Price (EUR)</th></tr><tr><td>Corolla</td><td>28950</td></tr></table>"}]"#;

    fn png() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 64, Rgba([255, 255, 255, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn options() -> ParseOptions {
        ParseOptions::builder().retry_backoff_ms(1).build().unwrap()
    }

    #[tokio::test]
    async fn failing_page_does_not_fail_document() {
        let doc = Document::from_page_images("list.pdf", vec![png(), png(), png()]).unwrap();
        let down = || BackendError::Connection {
            detail: "refused".into(),
        };
        let backend = ScriptedBackend::new(TABLE_PAGE).on_page(2, vec![Err(down()), Err(down())]);
        let mapping = FieldMapping::builtin().unwrap();
        let result = parse_document(&doc, &backend, &mapping, &options()).await.unwrap();

        assert_eq!(
            result.page_statuses(),
            vec![PageStatus::Ok, PageStatus::Failed, PageStatus::Ok]
        );
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.pages[1].attempts, 2);
        assert_eq!(result.pages[1].error.as_ref().unwrap().kind, ErrorKind::BackendError);
        let pages: Vec<usize> = result.records.iter().map(|r| r.source.page).collect();
        assert_eq!(pages, vec![1, 3]);
    }

    #[tokio::test]
    async fn undecodable_document_is_fatal() {
        let doc = Document::image("scan.png", b"garbage".to_vec()).unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let err = parse_document(&doc, &backend, &mapping, &options()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrchestrationError);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn one_undecodable_page_fails_alone() {
        let doc =
            Document::from_page_images("list.pdf", vec![png(), b"garbage".to_vec()]).unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let result = parse_document(&doc, &backend, &mapping, &options()).await.unwrap();
        assert_eq!(result.page_statuses(), vec![PageStatus::Ok, PageStatus::Failed]);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn spreadsheet_skips_backend() {
        let s = |v: &str| Some(v.to_string());
        let sheet = Sheet {
            name: "S".into(),
            rows: vec![
                vec![s("Model"), s("Price (EUR)")],
                vec![s("Corolla"), s("28950")],
            ],
            merges: vec![],
        };
        let doc = Document::spreadsheet("t.xlsx", vec![sheet]).unwrap();
        let backend = ScriptedBackend::new("unused");
        let mapping = FieldMapping::builtin().unwrap();
        let result = parse_document(&doc, &backend, &mapping, &options()).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.kind, DocumentKind::Spreadsheet);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn selection_outside_document_is_fatal() {
        let doc = Document::image("a.png", png()).unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let opts = ParseOptions::builder()
            .pages(crate::config::PageSelection::Single(4))
            .build()
            .unwrap();
        assert!(parse_document(&doc, &backend, &mapping, &opts).await.is_err());
    }

    struct CancelAfter {
        pages: AtomicUsize,
        limit: usize,
    }

    impl RunObserver for CancelAfter {
        fn on_page(&self, _report: &PageReport) {
            self.pages.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.pages.load(Ordering::SeqCst) >= self.limit
        }
    }

    #[tokio::test]
    async fn cancellation_between_pages_keeps_finished_pages() {
        let doc = Document::from_page_images("list.pdf", vec![png(), png(), png()]).unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let observer = CancelAfter {
            pages: AtomicUsize::new(0),
            limit: 1,
        };
        let run = run_document(&doc, &backend, &mapping, &options(), "j", &observer)
            .await
            .unwrap();
        assert!(run.cancelled);
        assert_eq!(run.result.pages.len(), 1);
        assert_eq!(run.result.stats.total_pages, 3);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_before_first_page_prepares_nothing() {
        let doc = Document::from_page_images(
            "list.pdf",
            vec![b"garbage".to_vec(), b"garbage".to_vec()],
        )
        .unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let observer = CancelAfter {
            pages: AtomicUsize::new(0),
            limit: 0,
        };
        let run = run_document(&doc, &backend, &mapping, &options(), "j", &observer)
            .await
            .unwrap();
        assert!(run.cancelled);
        assert!(run.result.pages.is_empty());
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_skips_preparing_remaining_pages() {
        let doc = Document::from_page_images(
            "list.pdf",
            vec![png(), b"garbage".to_vec(), b"garbage".to_vec()],
        )
        .unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let observer = CancelAfter {
            pages: AtomicUsize::new(0),
            limit: 1,
        };
        let run = run_document(&doc, &backend, &mapping, &options(), "j", &observer)
            .await
            .unwrap();
        assert!(run.cancelled);
        assert_eq!(run.result.page_statuses(), vec![PageStatus::Ok]);
    }

    #[tokio::test]
    async fn write_result_is_atomic_json() {
        let doc = Document::image("a.png", png()).unwrap();
        let backend = ScriptedBackend::new(TABLE_PAGE);
        let mapping = FieldMapping::builtin().unwrap();
        let result = parse_document(&doc, &backend, &mapping, &options()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/a.json");
        write_result(&result, &path).await.unwrap();
        let back: ParseResult =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.records.len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
