use crate::backend::{BackendInfo, InferenceBackend};
use crate::config::{OrchestratorConfig, ParseOptions};
use crate::convert::{run_document, RunObserver, RunOutcome};
use crate::document::Document;
use crate::error::{ErrorDetail, ErrorKind, InputError, PricelistError};
use crate::jobs::registry::{JobRegistry, JobState, JobStatus};
use crate::output::{PageReport, ParseResult};
use crate::pipeline::mapping::FieldMapping;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of [`Orchestrator::run_sync`].
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The job finished (or was cancelled) within the wait.
    Completed { job_id: String, result: ParseResult },
    /// The job failed as a whole.
    Failed { job_id: String, error: ErrorDetail },
    /// Still running; poll with this id.
    Pending { job_id: String },
}

impl SyncOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            SyncOutcome::Completed { job_id, .. }
            | SyncOutcome::Failed { job_id, .. }
            | SyncOutcome::Pending { job_id } => job_id,
        }
    }
}

struct QueuedJob {
    job_id: String,
    document: Document,
    options: ParseOptions,
}

struct Shared {
    registry: JobRegistry,
    backend: Arc<dyn InferenceBackend>,
    mapping: Arc<FieldMapping>,
}

/// Accepts documents, runs them on a bounded pool of workers and serves
/// their status.
///
/// Jobs start in submission order. Each job's pages run one after another
/// on its worker; at most `workers` jobs run at once. Dropping the
/// orchestrator lets queued jobs drain, then the workers exit.
pub struct Orchestrator {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Start the worker pool. Must be called inside a Tokio runtime.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        mapping: Arc<FieldMapping>,
        config: OrchestratorConfig,
    ) -> Result<Self, PricelistError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            registry: JobRegistry::new(config.max_jobs),
            backend,
            mapping,
        });
        let (queue, rx) = mpsc::unbounded_channel::<QueuedJob>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..config.workers)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, Arc::clone(&rx), Arc::clone(&shared))))
            .collect();

        let info = shared.backend.describe();
        info!(
            "Started {} workers ({} backend, model '{}')",
            config.workers, info.kind, info.model
        );

        Ok(Self {
            shared,
            queue,
            workers,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn backend_info(&self) -> BackendInfo {
        self.shared.backend.describe()
    }

    /// Queue a document and return its job id.
    ///
    /// # Errors
    /// `InputError` if the document has nothing to process, `InvalidConfig`
    /// if the options are out of range; no job is created in either case.
    pub fn submit(&self, document: Document, options: ParseOptions) -> Result<String, PricelistError> {
        if document.page_count() == 0 {
            return Err(InputError::EmptyDocument {
                file_name: document.file_name().to_string(),
            }
            .into());
        }
        options.validate()?;
        let total = options.pages.to_indices(document.page_count()).len();
        let job_id = self
            .shared
            .registry
            .create(document.file_name(), document.kind(), total);

        let job = QueuedJob {
            job_id: job_id.clone(),
            document,
            options,
        };
        if self.queue.send(job).is_err() {
            let detail = "worker pool has shut down".to_string();
            self.shared
                .registry
                .fail(&job_id, ErrorDetail::new(ErrorKind::OrchestrationError, detail.clone()));
            return Err(PricelistError::Orchestration { detail });
        }
        Ok(job_id)
    }

    pub fn poll(&self, job_id: &str) -> Result<JobStatus, PricelistError> {
        self.shared.registry.snapshot(job_id)
    }

    /// Wait up to `timeout` for a job to become terminal, then return its status.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> Result<JobStatus, PricelistError> {
        let mut done = self.shared.registry.subscribe(job_id)?;
        let finished = async move { done.wait_for(|finished| *finished).await.map(|_| ()) };
        match tokio::time::timeout(timeout, finished).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                return Err(PricelistError::JobNotFound {
                    job_id: job_id.to_string(),
                })
            }
            Err(_) => debug!("Job {} not finished after {:?}", job_id, timeout),
        }
        self.poll(job_id)
    }

    /// Submit and block until the job ends or `timeout` elapses.
    ///
    /// On timeout the job keeps running and its id is returned for polling.
    /// `None` uses the configured default wait.
    pub async fn run_sync(
        &self,
        document: Document,
        options: ParseOptions,
        timeout: Option<Duration>,
    ) -> Result<SyncOutcome, PricelistError> {
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.sync_timeout_secs));
        let job_id = self.submit(document, options)?;
        let status = self.wait(&job_id, timeout).await?;

        Ok(match (status.state, status.result, status.error) {
            (JobState::Completed | JobState::Cancelled, Some(result), _) => {
                SyncOutcome::Completed { job_id, result }
            }
            (JobState::Failed, _, error) => SyncOutcome::Failed {
                job_id,
                error: error.unwrap_or_else(|| {
                    ErrorDetail::new(ErrorKind::InternalError, "job failed without detail")
                }),
            },
            (state, ..) => {
                if state.is_terminal() {
                    warn!("Job {} is {} but has no result", job_id, state);
                } else {
                    info!("Job {} still {} after {:?}, poll for the result", job_id, state, timeout);
                }
                SyncOutcome::Pending { job_id }
            }
        })
    }

    /// Request cancellation; see [`JobRegistry::request_cancel`].
    pub fn cancel(&self, job_id: &str) -> Result<JobState, PricelistError> {
        self.shared.registry.request_cancel(job_id)
    }

    /// Remove a terminal job from the registry.
    pub fn evict(&self, job_id: &str) -> Result<(), PricelistError> {
        self.shared.registry.evict(job_id)
    }

    /// Stop accepting jobs, let the queue drain and wait for every worker.
    pub async fn shutdown(self) {
        info!("Shutting down worker pool...");
        drop(self.queue);
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!("Worker {} panicked: {}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    shared: Arc<Shared>,
) {
    debug!("Worker {} started", worker_id);
    loop {
        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            debug!("Worker {} job channel closed", worker_id);
            break;
        };
        let job_id = job.job_id.clone();
        debug!("Worker {} picked job {}", worker_id, job_id);

        // Run in its own task so a panic fails the job, not the worker.
        let task = tokio::spawn(run_job(Arc::clone(&shared), job));
        if let Err(e) = task.await {
            error!("Job {} crashed on worker {}: {}", job_id, worker_id, e);
            shared.registry.fail(
                &job_id,
                ErrorDetail::new(ErrorKind::OrchestrationError, format!("worker crashed: {e}")),
            );
        }
    }
    debug!("Worker {} stopped", worker_id);
}

async fn run_job(shared: Arc<Shared>, job: QueuedJob) {
    let QueuedJob {
        job_id,
        document,
        options,
    } = job;
    if !shared.registry.mark_processing(&job_id) {
        debug!("Job {} no longer queued, skipping", job_id);
        return;
    }

    let mapping = options
        .mapping
        .clone()
        .unwrap_or_else(|| Arc::clone(&shared.mapping));
    let handle = JobHandle {
        registry: &shared.registry,
        job_id: &job_id,
    };

    match run_document(
        &document,
        shared.backend.as_ref(),
        &mapping,
        &options,
        &job_id,
        &handle,
    )
    .await
    {
        Ok(RunOutcome {
            result,
            cancelled: false,
        }) => shared.registry.complete(&job_id, result),
        Ok(RunOutcome {
            result,
            cancelled: true,
        }) => shared.registry.finish_cancelled(&job_id, result),
        Err(e) => {
            warn!("Job {} failed: {}", job_id, e);
            shared.registry.fail(&job_id, e.detail());
        }
    }
}

/// Publishes a running job's progress into the registry.
struct JobHandle<'a> {
    registry: &'a JobRegistry,
    job_id: &'a str,
}

impl RunObserver for JobHandle<'_> {
    fn on_start(&self, total_pages: usize) {
        self.registry.set_total_pages(self.job_id, total_pages);
    }

    fn on_page(&self, report: &PageReport) {
        self.registry.record_page(self.job_id, report);
    }

    fn is_cancelled(&self) -> bool {
        self.registry.is_cancel_requested(self.job_id)
    }
}
