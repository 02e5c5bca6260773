//! In-memory job registry.
//!
//! The registry is the only mutable state shared between jobs. Every state
//! transition and progress update takes the write lock; [`JobRegistry::snapshot`]
//! copies a consistent [`JobStatus`] out under the read lock.
//!
//! ```text
//!  queued ──▶ processing ──▶ completed
//!    │            │    └────▶ failed
//!    └────────────┴─────────▶ cancelled
//! ```

use crate::document::DocumentKind;
use crate::error::{ErrorDetail, PricelistError};
use crate::output::{PageReport, ParseResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    /// Stopped between pages on request; holds the pages finished so far.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a job, as returned by a poll.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub file_name: String,
    pub kind: DocumentKind,
    /// Pages selected for processing.
    pub total_pages: usize,
    /// Pages attempted so far, whatever their outcome.
    pub pages_done: usize,
    /// `"done/total"`.
    pub progress: String,
    /// Seconds since the job left the queue, rounded to 10 ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_seconds: Option<f64>,
    /// Linear estimate from the pages done so far; absent before the first page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
    pub cancel_requested: bool,
    /// Annotations for the pages attempted so far.
    pub pages: Vec<PageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ParseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

struct JobRecord {
    seq: u64,
    file_name: String,
    kind: DocumentKind,
    state: JobState,
    total_pages: usize,
    pages: Vec<PageReport>,
    created_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    cancel_requested: bool,
    result: Option<ParseResult>,
    error: Option<ErrorDetail>,
    done: watch::Sender<bool>,
}

impl JobRecord {
    fn finish(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(Instant::now());
        self.done.send_replace(true);
    }

    fn status(&self, job_id: &str) -> JobStatus {
        let pages_done = self.pages.len();
        let elapsed = self
            .started_at
            .map(|start| self.finished_at.unwrap_or_else(Instant::now) - start)
            .map(|d| d.as_secs_f64());
        let estimated_remaining_seconds = match (self.state, elapsed) {
            (JobState::Processing, Some(secs)) if pages_done > 0 => {
                let remaining = self.total_pages.saturating_sub(pages_done) as f64;
                Some(round_to(remaining * secs / pages_done as f64, 1))
            }
            _ => None,
        };
        JobStatus {
            job_id: job_id.to_string(),
            state: self.state,
            file_name: self.file_name.clone(),
            kind: self.kind,
            total_pages: self.total_pages,
            pages_done,
            progress: format!("{}/{}", pages_done, self.total_pages),
            processing_seconds: elapsed.map(|s| round_to(s, 2)),
            estimated_remaining_seconds,
            cancel_requested: self.cancel_requested,
            pages: self.pages.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    next_seq: u64,
}

/// Thread-safe store of every job known to the process.
pub struct JobRegistry {
    inner: RwLock<Inner>,
    max_jobs: usize,
}

impl JobRegistry {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_jobs,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Creation and eviction ────────────────────────────────────────────

    /// Register a queued job and return its identifier.
    ///
    /// At the retention limit the oldest half of terminal jobs is evicted
    /// first. Identifiers are random 128-bit values and are never reused.
    pub fn create(&self, file_name: &str, kind: DocumentKind, total_pages: usize) -> String {
        let mut inner = self.write();
        if inner.jobs.len() >= self.max_jobs {
            evict_oldest_terminal(&mut inner);
        }

        let mut job_id = Uuid::new_v4().simple().to_string();
        while inner.jobs.contains_key(&job_id) {
            job_id = Uuid::new_v4().simple().to_string();
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let (done, _) = watch::channel(false);
        inner.jobs.insert(
            job_id.clone(),
            JobRecord {
                seq,
                file_name: file_name.to_string(),
                kind,
                state: JobState::Queued,
                total_pages,
                pages: Vec::new(),
                created_at: Instant::now(),
                started_at: None,
                finished_at: None,
                cancel_requested: false,
                result: None,
                error: None,
                done,
            },
        );
        debug!("Job {} queued for '{}' ({} page(s))", job_id, file_name, total_pages);
        job_id
    }

    /// Remove a terminal job.
    pub fn evict(&self, job_id: &str) -> Result<(), PricelistError> {
        let mut inner = self.write();
        let state = inner
            .jobs
            .get(job_id)
            .map(|job| job.state)
            .ok_or_else(|| not_found(job_id))?;
        if !state.is_terminal() {
            return Err(PricelistError::JobNotTerminal {
                job_id: job_id.to_string(),
            });
        }
        inner.jobs.remove(job_id);
        debug!("Job {} evicted", job_id);
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// `queued → processing`. Returns `false` when the job was cancelled or
    /// evicted while waiting for a worker.
    pub fn mark_processing(&self, job_id: &str) -> bool {
        let mut inner = self.write();
        match inner.jobs.get_mut(job_id) {
            Some(job) if job.state == JobState::Queued => {
                job.state = JobState::Processing;
                job.started_at = Some(Instant::now());
                debug!(
                    "Job {} started after {:.2}s in queue",
                    job_id,
                    job.created_at.elapsed().as_secs_f64()
                );
                true
            }
            _ => false,
        }
    }

    /// Correct the page count once the selection has been applied.
    pub fn set_total_pages(&self, job_id: &str, total_pages: usize) {
        if let Some(job) = self.write().jobs.get_mut(job_id) {
            job.total_pages = total_pages;
        }
    }

    /// Append one attempted page. Progress only moves forward.
    pub fn record_page(&self, job_id: &str, report: &PageReport) {
        let mut inner = self.write();
        match inner.jobs.get_mut(job_id) {
            Some(job) if job.state == JobState::Processing => job.pages.push(report.clone()),
            Some(job) => warn!(
                "Job {}: ignoring page {} reported in state {}",
                job_id, report.page, job.state
            ),
            None => {}
        }
    }

    /// `processing → completed`.
    pub fn complete(&self, job_id: &str, result: ParseResult) {
        self.finish(job_id, JobState::Completed, Some(result), None);
    }

    /// `processing → cancelled`, keeping the partial result.
    pub fn finish_cancelled(&self, job_id: &str, result: ParseResult) {
        self.finish(job_id, JobState::Cancelled, Some(result), None);
    }

    /// `queued | processing → failed`.
    pub fn fail(&self, job_id: &str, error: ErrorDetail) {
        self.finish(job_id, JobState::Failed, None, Some(error));
    }

    fn finish(
        &self,
        job_id: &str,
        state: JobState,
        result: Option<ParseResult>,
        error: Option<ErrorDetail>,
    ) {
        let mut inner = self.write();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            warn!("Job {} vanished before reaching {}", job_id, state);
            return;
        };
        if job.state.is_terminal() {
            warn!("Job {} already {}, not moving to {}", job_id, job.state, state);
            return;
        }
        if let Some(result) = result {
            job.pages = result.pages.clone();
            job.result = Some(result);
        }
        job.error = error;
        job.finish(state);
        info!("Job {} {}", job_id, state);
    }

    /// Ask a job to stop.
    ///
    /// A queued job is cancelled at once. A processing job stops before its
    /// next page; the in-flight inference call runs to completion. Terminal
    /// jobs are left alone. Returns the state after the request.
    pub fn request_cancel(&self, job_id: &str) -> Result<JobState, PricelistError> {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        match job.state {
            JobState::Queued => {
                job.cancel_requested = true;
                job.finish(JobState::Cancelled);
                info!("Job {} cancelled while queued", job_id);
            }
            JobState::Processing => {
                job.cancel_requested = true;
                info!("Job {} cancellation requested", job_id);
            }
            _ => {}
        }
        Ok(job.state)
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> bool {
        self.read()
            .jobs
            .get(job_id)
            .is_some_and(|job| job.cancel_requested)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn snapshot(&self, job_id: &str) -> Result<JobStatus, PricelistError> {
        self.read()
            .jobs
            .get(job_id)
            .map(|job| job.status(job_id))
            .ok_or_else(|| not_found(job_id))
    }

    /// A receiver that flips to `true` once the job is terminal.
    pub fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<bool>, PricelistError> {
        self.read()
            .jobs
            .get(job_id)
            .map(|job| job.done.subscribe())
            .ok_or_else(|| not_found(job_id))
    }
}

fn not_found(job_id: &str) -> PricelistError {
    PricelistError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

/// Drop the oldest half (at least one) of the terminal jobs.
fn evict_oldest_terminal(inner: &mut Inner) {
    let mut terminal: Vec<(u64, String)> = inner
        .jobs
        .iter()
        .filter(|(_, job)| job.state.is_terminal())
        .map(|(id, job)| (job.seq, id.clone()))
        .collect();
    if terminal.is_empty() {
        warn!(
            "Job registry holds {} unfinished job(s), admitting one more",
            inner.jobs.len()
        );
        return;
    }
    terminal.sort_unstable();
    let to_remove = (terminal.len() / 2).max(1);
    for (_, id) in terminal.into_iter().take(to_remove) {
        inner.jobs.remove(&id);
    }
    debug!("Evicted {} terminal job(s)", to_remove);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::output::PageStatus;

    fn page(n: usize) -> PageReport {
        PageReport {
            page: n,
            sheet_name: None,
            status: PageStatus::Ok,
            tables: Vec::new(),
            records: 0,
            skipped_rows: 0,
            attempts: 1,
            repair_passes: 0,
            duration_ms: 0,
            error: None,
        }
    }

    fn result(pages: Vec<PageReport>) -> ParseResult {
        ParseResult::assemble("a.pdf".into(), DocumentKind::Pdf, 2, Vec::new(), pages, 5)
    }

    #[test]
    fn lifecycle_and_progress() {
        let reg = JobRegistry::new(10);
        let id = reg.create("a.pdf", DocumentKind::Pdf, 2);
        let s = reg.snapshot(&id).unwrap();
        assert_eq!(s.state, JobState::Queued);
        assert_eq!(s.progress, "0/2");
        assert!(s.processing_seconds.is_none());
        assert!(s.estimated_remaining_seconds.is_none());

        assert!(reg.mark_processing(&id));
        assert!(!reg.mark_processing(&id));
        reg.record_page(&id, &page(1));
        let s = reg.snapshot(&id).unwrap();
        assert_eq!(s.state, JobState::Processing);
        assert_eq!(s.progress, "1/2");
        assert!(s.estimated_remaining_seconds.is_some());

        reg.record_page(&id, &page(2));
        reg.complete(&id, result(vec![page(1), page(2)]));
        let s = reg.snapshot(&id).unwrap();
        assert_eq!(s.state, JobState::Completed);
        assert_eq!(s.pages_done, 2);
        assert!(s.result.is_some());
        assert!(s.estimated_remaining_seconds.is_none());
        assert!(*reg.subscribe(&id).unwrap().borrow());
    }

    #[test]
    fn terminal_state_is_final() {
        let reg = JobRegistry::new(10);
        let id = reg.create("a.pdf", DocumentKind::Pdf, 1);
        reg.mark_processing(&id);
        reg.fail(
            &id,
            ErrorDetail::new(ErrorKind::OrchestrationError, "no pages"),
        );
        reg.complete(&id, result(vec![]));
        let s = reg.snapshot(&id).unwrap();
        assert_eq!(s.state, JobState::Failed);
        assert!(s.result.is_none());
        assert_eq!(s.error.unwrap().kind, ErrorKind::OrchestrationError);
    }

    #[test]
    fn ids_are_unique_hex() {
        let reg = JobRegistry::new(1000);
        let ids: std::collections::HashSet<String> = (0..200)
            .map(|_| reg.create("a.pdf", DocumentKind::Pdf, 1))
            .collect();
        assert_eq!(ids.len(), 200);
        assert!(ids.iter().all(|id| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn cancel_queued_is_immediate() {
        let reg = JobRegistry::new(10);
        let id = reg.create("a.pdf", DocumentKind::Pdf, 3);
        assert_eq!(reg.request_cancel(&id).unwrap(), JobState::Cancelled);
        assert!(!reg.mark_processing(&id));
    }

    #[test]
    fn cancel_processing_is_deferred() {
        let reg = JobRegistry::new(10);
        let id = reg.create("a.pdf", DocumentKind::Pdf, 3);
        reg.mark_processing(&id);
        assert_eq!(reg.request_cancel(&id).unwrap(), JobState::Processing);
        assert!(reg.is_cancel_requested(&id));
        reg.finish_cancelled(&id, result(vec![page(1)]));
        let s = reg.snapshot(&id).unwrap();
        assert_eq!(s.state, JobState::Cancelled);
        assert_eq!(s.pages_done, 1);
    }

    #[test]
    fn evict_requires_terminal() {
        let reg = JobRegistry::new(10);
        let id = reg.create("a.pdf", DocumentKind::Pdf, 1);
        assert!(matches!(
            reg.evict(&id),
            Err(PricelistError::JobNotTerminal { .. })
        ));
        reg.request_cancel(&id).unwrap();
        reg.evict(&id).unwrap();
        assert!(matches!(
            reg.snapshot(&id),
            Err(PricelistError::JobNotFound { .. })
        ));
    }

    #[test]
    fn retention_limit_evicts_oldest_terminal_half() {
        let reg = JobRegistry::new(4);
        let ids: Vec<String> = (0..4)
            .map(|_| reg.create("a.pdf", DocumentKind::Pdf, 1))
            .collect();
        for id in &ids[..3] {
            reg.request_cancel(id).unwrap();
        }
        let newest = reg.create("b.pdf", DocumentKind::Pdf, 1);
        // three terminal → one evicted, the oldest
        assert!(reg.snapshot(&ids[0]).is_err());
        assert!(reg.snapshot(&ids[1]).is_ok());
        assert!(reg.snapshot(&ids[3]).is_ok());
        assert!(reg.snapshot(&newest).is_ok());
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn retention_limit_never_drops_running_jobs() {
        let reg = JobRegistry::new(2);
        let a = reg.create("a.pdf", DocumentKind::Pdf, 1);
        let b = reg.create("b.pdf", DocumentKind::Pdf, 1);
        reg.create("c.pdf", DocumentKind::Pdf, 1);
        assert!(reg.snapshot(&a).is_ok());
        assert!(reg.snapshot(&b).is_ok());
        assert_eq!(reg.len(), 3);
    }
}
