//! CLI binary for pricelist-ocr.
//!
//! A thin shim over the library crate: loads each input as a document,
//! submits it to the job orchestrator and prints (or writes) the results.

use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use indicatif::{ProgressBar, ProgressStyle};
use pricelist_ocr::{
    build_backend, load_document, resolve_mapping_file, write_result, BackendConfig, BackendKind,
    Device, FieldMapping, JobProgressCallback, JobState, JobStatus, Orchestrator,
    OrchestratorConfig, PageSelection, PageStatus, ParseOptions, ParseResult, ProgressCallback,
    PromptMode,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>3}/{len} pages  \
         ⏱ {elapsed_precise}  ETA {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS)
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar across every submitted job, one log
/// line per finished page. Jobs run concurrently, so pages of different
/// documents interleave.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<(String, usize), Instant>>,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style());
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            failed: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, job_id: &str, page: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&(job_id.to_string(), page)))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, job_id: &str, total_pages: usize) {
        self.bar.inc_length(total_pages as u64);
        self.bar
            .println(format!("{} job {} started, {} page(s)", dim("◆"), short_id(job_id), total_pages));
    }

    fn on_page_start(&self, job_id: &str, page: usize, _total_pages: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert((job_id.to_string(), page), Instant::now());
        }
        self.bar.set_message(format!("{} p{page}", short_id(job_id)));
    }

    fn on_page_complete(
        &self,
        job_id: &str,
        page: usize,
        total_pages: usize,
        status: PageStatus,
        records: usize,
    ) {
        let mark = match status {
            PageStatus::Ok => green("✓"),
            PageStatus::Partial => yellow("~"),
            PageStatus::Failed => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                red("✗")
            }
        };
        self.bar.println(format!(
            "  {} {} page {:>3}/{:<3}  {}  {}",
            mark,
            dim(short_id(job_id)),
            page,
            total_pages,
            dim(&format!("{records:>4} records")),
            dim(&format!("{:.1}s", self.elapsed(job_id, page))),
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One scanned page, default quantized backend
  pricelist-ocr scans/bmw-page1.png

  # A rasterised PDF (directory of page images), results to a file
  pricelist-ocr scans/toyota-2024/ -o toyota.json

  # A workbook exported as sheet-grid JSON; no inference needed
  pricelist-ocr exports/vw.sheets.json --json

  # Remote accelerated server, two documents side by side
  pricelist-ocr --backend remote --endpoint http://gpu-box:8000 a/ b/ -o out/

  # OEM-specific header rules
  pricelist-ocr --mapping-dir field_mappings --mapping toyota scans/toyota-2024/

  # Submit, then poll for progress instead of waiting
  pricelist-ocr --poll scans/big-catalogue/

INPUTS:
  image file          .png / .jpg / .jpeg, one page
  directory           page images in file-name order, treated as one pdf
  *.json              array of {"name", "rows", "merges"} sheet grids

ENVIRONMENT VARIABLES:
  PRICELIST_BACKEND       quantized | full-precision | remote
  PRICELIST_MODEL         Model tag / served model name
  PRICELIST_PROVIDER      edgequake-llm provider for the quantized backend
  PRICELIST_ENDPOINT      Base URL of the remote server
  PRICELIST_API_KEY       Bearer token for the remote server
  RUST_LOG                Overrides the log filter
"#;

/// Extract vehicle pricelist records from page images and spreadsheets.
#[derive(Parser, Debug)]
#[command(
    name = "pricelist-ocr",
    version,
    about = "Extract vehicle pricelist records from page images and spreadsheets",
    long_about = "Runs each input through an OCR vision model (or reads sheet cells directly), \
repairs the model output, extracts tables and maps their columns onto a fixed pricing schema.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Image files, directories of page images, or sheet-grid JSON files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Write JSON results here. A file for one input, a directory for several.
    #[arg(short, long, env = "PRICELIST_OUTPUT")]
    output: Option<PathBuf>,

    /// Inference backend.
    #[arg(long, env = "PRICELIST_BACKEND", value_enum, default_value = "quantized")]
    backend: BackendArg,

    /// Model tag (quantized) or served model name (remote).
    #[arg(long, env = "PRICELIST_MODEL")]
    model: Option<String>,

    /// edgequake-llm provider for the quantized backend (ollama, openai, …).
    #[arg(long, env = "PRICELIST_PROVIDER")]
    provider: Option<String>,

    /// Remote server base URL.
    #[arg(long, env = "PRICELIST_ENDPOINT")]
    endpoint: Option<String>,

    /// Remote server bearer token.
    #[arg(long, env = "PRICELIST_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Device for the full-precision backend: cpu, cuda, cuda:N, mps.
    #[arg(long, env = "PRICELIST_DEVICE", default_value = "cpu")]
    device: String,

    /// Full-precision runner command line (program and leading args).
    #[arg(long, env = "PRICELIST_RUNNER")]
    runner: Option<String>,

    /// Page pixel budget.
    #[arg(long, env = "PRICELIST_MAX_PIXELS")]
    max_pixels: Option<u32>,

    /// Max model output tokens per page.
    #[arg(long, env = "PRICELIST_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Sampling temperature.
    #[arg(long, env = "PRICELIST_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per page on transient backend failure.
    #[arg(long, env = "PRICELIST_MAX_RETRIES", default_value_t = 1)]
    max_retries: u32,

    /// Per-call inference timeout in seconds.
    #[arg(long, env = "PRICELIST_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// What the model is asked to return.
    #[arg(long, env = "PRICELIST_PROMPT_MODE", value_enum, default_value = "layout")]
    prompt_mode: PromptArg,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PRICELIST_PAGES", default_value = "all")]
    pages: String,

    /// Field-mapping rule file, or a rule name inside --mapping-dir.
    #[arg(long, env = "PRICELIST_MAPPING")]
    mapping: Option<String>,

    /// Directory holding named field-mapping rule files.
    #[arg(long, env = "PRICELIST_MAPPING_DIR")]
    mapping_dir: Option<PathBuf>,

    /// Documents processed concurrently.
    #[arg(short, long, env = "PRICELIST_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds to wait for each document before giving up on it.
    #[arg(long, env = "PRICELIST_TIMEOUT", default_value_t = 3600)]
    timeout: u64,

    /// Submit everything, then poll job status instead of streaming page events.
    #[arg(long)]
    poll: bool,

    /// Print results as JSON on stdout.
    #[arg(long, env = "PRICELIST_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PRICELIST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PRICELIST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PRICELIST_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Quantized,
    FullPrecision,
    Remote,
}

impl From<BackendArg> for BackendKind {
    fn from(v: BackendArg) -> Self {
        match v {
            BackendArg::Quantized => BackendKind::Quantized,
            BackendArg::FullPrecision => BackendKind::FullPrecision,
            BackendArg::Remote => BackendKind::Remote,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PromptArg {
    Layout,
    Tables,
}

impl From<PromptArg> for PromptMode {
    fn from(v: PromptArg) -> Self {
        match v {
            PromptArg::Layout => PromptMode::LayoutAll,
            PromptArg::Tables => PromptMode::TablesOnly,
        }
    }
}

/// One input after submission.
struct Submitted {
    input: PathBuf,
    job_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build backend, mapping and orchestrator ──────────────────────────
    let backend = build_backend(&backend_config(&cli)?).context("Failed to set up backend")?;
    let mapping = Arc::new(load_mapping(&cli)?);
    let orchestrator = Orchestrator::new(
        backend,
        mapping,
        OrchestratorConfig {
            workers: cli.workers,
            sync_timeout_secs: cli.timeout,
            ..Default::default()
        },
    )
    .context("Invalid orchestrator configuration")?;

    let progress = (show_progress && !cli.poll).then(CliProgressCallback::new);
    let options = parse_options(&cli, progress.clone().map(|cb| cb as ProgressCallback))?;

    // ── Submit every input ───────────────────────────────────────────────
    let mut submitted = Vec::with_capacity(cli.inputs.len());
    let mut rejected = 0usize;
    for input in &cli.inputs {
        let result = load_document(input).and_then(|doc| orchestrator.submit(doc, options.clone()));
        match result {
            Ok(job_id) => {
                tracing::info!("{} → job {}", input.display(), job_id);
                submitted.push(Submitted {
                    input: input.clone(),
                    job_id,
                });
            }
            Err(e) => {
                rejected += 1;
                eprintln!("{} {}: {} ({})", red("✗"), input.display(), e, e.kind());
            }
        }
    }

    // ── Wait for results ─────────────────────────────────────────────────
    let timeout = Duration::from_secs(cli.timeout);
    let statuses = if cli.poll {
        poll_until_done(&orchestrator, &submitted, timeout, show_progress).await?
    } else {
        future::try_join_all(
            submitted
                .iter()
                .map(|job| orchestrator.wait(&job.job_id, timeout)),
        )
        .await?
    };
    if let Some(cb) = progress {
        cb.bar.finish_and_clear();
        let failed_pages = cb.failed.load(Ordering::SeqCst);
        if failed_pages > 0 {
            eprintln!("{} {} page(s) failed", red("✗"), failed_pages);
        }
    }

    // ── Report ───────────────────────────────────────────────────────────
    let mut failed = rejected;
    let mut results: Vec<(&Submitted, &ParseResult)> = Vec::new();
    for (job, status) in submitted.iter().zip(&statuses) {
        match (&status.state, &status.result) {
            (JobState::Completed | JobState::Cancelled, Some(result)) => results.push((job, result)),
            (JobState::Failed, _) => {
                failed += 1;
                let detail = status
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                eprintln!("{} {}: {}", red("✘"), job.input.display(), detail);
            }
            (state, _) => {
                failed += 1;
                eprintln!(
                    "{} {}: still {} after {}s (job {})",
                    yellow("⚠"),
                    job.input.display(),
                    state,
                    cli.timeout,
                    job.job_id
                );
            }
        }
    }

    if let Some(ref output) = cli.output {
        for (job, result) in &results {
            let path = output_path(output, &job.input, cli.inputs.len() > 1);
            write_result(result, &path)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("   → {}", bold(&path.display().to_string()));
            }
        }
    }

    if cli.json {
        let payload: Vec<&ParseResult> = results.iter().map(|(_, r)| *r).collect();
        let json = if payload.len() == 1 {
            serde_json::to_string_pretty(payload[0])
        } else {
            serde_json::to_string_pretty(&payload)
        }
        .context("Failed to serialise results")?;
        println!("{json}");
    } else if !cli.quiet {
        for (job, result) in &results {
            print_summary(&job.input, result);
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} input(s) did not complete", failed, cli.inputs.len());
    }
    Ok(())
}

/// Map CLI args to `BackendConfig`.
fn backend_config(cli: &Cli) -> Result<BackendConfig> {
    let mut config = BackendConfig {
        kind: cli.backend.into(),
        device: cli
            .device
            .parse::<Device>()
            .context("Invalid --device")?,
        api_key: cli.api_key.clone(),
        ..Default::default()
    };
    if let Some(ref model) = cli.model {
        config.model = model.clone();
    }
    if let Some(ref provider) = cli.provider {
        config.provider_name = provider.clone();
    }
    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(ref runner) = cli.runner {
        config.command = runner.split_whitespace().map(str::to_string).collect();
    }
    Ok(config)
}

/// `--mapping` is a file path, or a rule name looked up in `--mapping-dir`.
fn load_mapping(cli: &Cli) -> Result<FieldMapping> {
    let Some(ref name) = cli.mapping else {
        return FieldMapping::builtin().context("Built-in field mapping is invalid");
    };
    let path = match cli.mapping_dir {
        Some(ref dir) if !Path::new(name).exists() => resolve_mapping_file(dir, name)?,
        _ => PathBuf::from(name),
    };
    FieldMapping::from_file(&path)
        .with_context(|| format!("Failed to load field mapping {}", path.display()))
}

/// Map CLI args to `ParseOptions`.
fn parse_options(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ParseOptions> {
    let pages: PageSelection = cli.pages.parse().context("Invalid --pages")?;
    let mut builder = ParseOptions::builder()
        .prompt_mode(cli.prompt_mode.into())
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .pages(pages);
    if let Some(px) = cli.max_pixels {
        builder = builder.max_pixels(px);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Poll every job until all are terminal or `timeout` elapses.
async fn poll_until_done(
    orchestrator: &Orchestrator,
    submitted: &[Submitted],
    timeout: Duration,
    show_progress: bool,
) -> Result<Vec<JobStatus>> {
    let bar = show_progress.then(|| {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style());
        bar.set_prefix("Polling");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });
    let deadline = Instant::now() + timeout;

    loop {
        let statuses = submitted
            .iter()
            .map(|job| orchestrator.poll(&job.job_id))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(ref bar) = bar {
            let total: usize = statuses.iter().map(|s| s.total_pages).sum();
            let done: usize = statuses.iter().map(|s| s.pages_done).sum();
            let eta = statuses
                .iter()
                .filter_map(|s| s.estimated_remaining_seconds)
                .fold(0.0_f64, f64::max);
            bar.set_length(total as u64);
            bar.set_position(done as u64);
            bar.set_message(format!("~{eta:.0}s left"));
        }

        if statuses.iter().all(|s| s.state.is_terminal()) || Instant::now() >= deadline {
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            return Ok(statuses);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn output_path(output: &Path, input: &Path, many: bool) -> PathBuf {
    if !many {
        return output.to_path_buf();
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "result".to_string());
    output.join(format!("{stem}.json"))
}

fn print_summary(input: &Path, result: &ParseResult) {
    let s = &result.stats;
    let mark = if s.failed_pages == 0 && s.partial_pages == 0 {
        green("✔")
    } else {
        yellow("⚠")
    };
    eprintln!(
        "{} {}  {} records  {}/{} pages ok  {} partial  {} failed  {} rows skipped  {}ms",
        mark,
        bold(&input.display().to_string()),
        s.records,
        s.ok_pages,
        s.attempted_pages,
        s.partial_pages,
        s.failed_pages,
        s.skipped_rows,
        s.duration_ms,
    );
    for page in &result.pages {
        if let Some(ref err) = page.error {
            eprintln!("     page {:>3}: {}", page.page, dim(&err.to_string()));
        }
    }
}
