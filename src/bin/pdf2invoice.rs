//! CLI binary for edgequake-invoice.
//!
//! A thin shim over the library crate: flags become a `PipelineConfig`, the
//! queue lives in a SQLite file, and results are printed as JSON.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_invoice::{
    EncryptionKey, InvoiceService, PdfKind, PipelineConfig, ProcessType,
    ProcessingProgressCallback, Processor, ProgressCallback, QueueStore, ShutdownSignal,
    SqliteStore, SubmitRequest, TaskId, TaskResult, TaskStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Progress bar ─────────────────────────────────────────────────────────────

/// One bar tick per invoice range. Ranges finish out of order, so the log
/// lines carry their own index.
struct RangeProgress {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl RangeProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix("Reading");
        bar.set_message("extracting page text…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl ProcessingProgressCallback for RangeProgress {
    fn on_task_start(&self, total_ranges: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} invoices  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        self.bar.set_length(total_ranges as u64);
        self.bar.set_prefix("Extracting");
    }

    fn on_range_complete(&self, index: usize, total: usize, fields_filled: usize) {
        self.bar.println(format!(
            "  {} Invoice {:>3}/{:<3}  {}",
            green("✓"),
            index,
            total,
            dim(&format!("{fields_filled} fields"))
        ));
        self.bar.inc(1);
    }

    fn on_range_error(&self, index: usize, total: usize, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg: String = error.chars().take(80).collect();
        self.bar
            .println(format!("  {} Invoice {:>3}/{:<3}  {}", red("✗"), index, total, red(&msg)));
        self.bar.inc(1);
    }

    fn on_task_complete(&self, total_ranges: usize, succeeded: usize) {
        self.bar.finish_and_clear();
        let failed = total_ranges.saturating_sub(succeeded);
        if failed == 0 {
            eprintln!("{} {} invoices extracted", green("✔"), bold(&succeeded.to_string()));
        } else {
            eprintln!(
                "{} {}/{} invoices extracted ({} failed)",
                red("⚠"),
                bold(&succeeded.to_string()),
                total_ranges,
                red(&failed.to_string())
            );
        }
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract three invoices from one PDF, inline
  pdf2invoice process batch.pdf -n 3

  # Scanned receipts, hints for the model
  pdf2invoice process scans.pdf -n 2 --kind scanned --process-type receipt \
      --metadata '{"merchant_names": ["ACME"]}'

  # Queue a job, run a worker, fetch the result
  export PDF2INVOICE_KEY=$(pdf2invoice keygen)
  pdf2invoice submit https://example.com/batch.pdf -n 4
  pdf2invoice worker --workers 2
  pdf2invoice status task_…
  pdf2invoice result task_…

ENVIRONMENT VARIABLES:
  PDF2INVOICE_KEY         Base64 AES-256 key for the queue (see `keygen`)
  PDF2INVOICE_DB          Queue database path (default: pdf2invoice.db)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory or file of the pdfium shared library
"#;

/// Extract structured invoices from PDF files with LLM function calling.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2invoice",
    version,
    about = "Extract structured invoices from PDF files with LLM function calling",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Base64 AES-256 key protecting queued payloads and results.
    #[arg(long, global = true, env = "PDF2INVOICE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Queue database file.
    #[arg(long, global = true, env = "PDF2INVOICE_DB", default_value = "pdf2invoice.db")]
    db: PathBuf,

    /// Concurrent extraction calls across all tasks.
    #[arg(short, long, global = true, env = "PDF2INVOICE_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Retries per LLM call.
    #[arg(long, global = true, env = "PDF2INVOICE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, global = true, env = "PDF2INVOICE_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "PDF2INVOICE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2INVOICE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a document now and print its result.
    Process {
        #[command(flatten)]
        task: TaskArgs,

        /// Disable the progress bar.
        #[arg(long, env = "PDF2INVOICE_NO_PROGRESS")]
        no_progress: bool,
    },
    /// Queue a document for the workers and print its task id.
    Submit {
        #[command(flatten)]
        task: TaskArgs,

        /// Seconds the task and its result stay readable.
        #[arg(long, env = "PDF2INVOICE_TTL")]
        ttl: Option<u64>,

        /// Block until the task finishes and print the result.
        #[arg(long)]
        wait: bool,
    },
    /// Print a task's status.
    Status { id: String },
    /// Print a completed task's result.
    Result { id: String },
    /// Drain the queue until Ctrl-C.
    Worker {
        /// Number of worker loops.
        #[arg(short, long, env = "PDF2INVOICE_WORKERS", default_value_t = 1)]
        workers: usize,

        /// Idle poll interval in milliseconds.
        #[arg(long, env = "PDF2INVOICE_POLL_MS", default_value_t = 1000)]
        poll_ms: u64,
    },
    /// Print a fresh base64 encryption key.
    Keygen,
}

#[derive(Args, Debug)]
struct TaskArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    document: String,

    /// Number of invoices in the document.
    #[arg(short = 'n', long = "invoices", default_value_t = 1)]
    invoice_count: usize,

    /// text, scanned, password_protected or copy_protected.
    #[arg(long, default_value = "text")]
    kind: PdfKind,

    /// invoice or receipt.
    #[arg(long, default_value = "invoice")]
    process_type: ProcessType,

    /// PDF user password.
    #[arg(long, env = "PDF2INVOICE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// JSON object of hints for the model.
    #[arg(long)]
    metadata: Option<String>,
}

impl TaskArgs {
    fn into_request(self) -> Result<SubmitRequest> {
        let mut request = SubmitRequest::new(self.document, self.invoice_count)
            .pdf_kind(self.kind)
            .process_type(self.process_type);
        if let Some(password) = self.password {
            request = request.password(password);
        }
        if let Some(raw) = self.metadata {
            let metadata: BTreeMap<String, Value> =
                serde_json::from_str(&raw).context("--metadata must be a JSON object")?;
            request = request.metadata(metadata);
        }
        Ok(request)
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command, global } = Cli::parse();

    let show_progress =
        matches!(command, Command::Process { no_progress: false, .. }) && !global.quiet;
    let filter = if global.verbose {
        "debug"
    } else if global.quiet || show_progress {
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

    match command {
        Command::Keygen => {
            println!("{}", EncryptionKey::generate().to_base64());
            Ok(())
        }
        Command::Process { task, .. } => {
            let progress: Option<ProgressCallback> = if show_progress {
                Some(RangeProgress::new() as Arc<dyn ProcessingProgressCallback>)
            } else {
                None
            };
            let config = build_config(&global, None, progress)?;
            let processor = Processor::from_config(Arc::new(config))
                .context("Failed to set up the LLM provider")?;
            let payload = task.into_request()?.into_payload()?;
            let result = processor
                .run(&payload, &ShutdownSignal::never())
                .await
                .context("Processing failed")?;
            print_result(&result)
        }
        Command::Submit { task, ttl, wait } => {
            let store = open_store(&global)?;
            let ttl = ttl.unwrap_or(PipelineConfig::default().default_ttl_secs);
            let payload = task.into_request()?.result_ttl_secs(ttl).into_payload()?;
            let id = store.enqueue(&payload, Duration::from_secs(ttl)).await?;

            if !wait {
                println!("{id}");
                return Ok(());
            }
            if !global.quiet {
                eprintln!("{} queued {}", dim("…"), bold(id.as_str()));
            }
            wait_for(&store, &id).await
        }
        Command::Status { id } => {
            let store = open_store(&global)?;
            let info = store.get_status(&TaskId::from(id)).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Command::Result { id } => {
            let store = open_store(&global)?;
            let result = store.get_result(&TaskId::from(id)).await?;
            print_result(&result)
        }
        Command::Worker { workers, poll_ms } => {
            let store = Arc::new(open_store(&global)?);
            let config = build_config(&global, Some((workers, poll_ms)), None)?;
            let processor = Processor::from_config(Arc::new(config))
                .context("Failed to set up the LLM provider")?;
            let service = InvoiceService::new(store, Arc::new(processor));

            let pool = service.spawn_workers();
            if !global.quiet {
                eprintln!(
                    "{} {} workers on {}  {}",
                    green("◆"),
                    pool.workers(),
                    bold(&global.db.display().to_string()),
                    dim("(Ctrl-C to stop)")
                );
            }
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            if !global.quiet {
                eprintln!("{} finishing in-flight tasks…", dim("…"));
            }
            pool.stop().await;
            Ok(())
        }
    }
}

fn key_from(global: &GlobalArgs) -> Result<EncryptionKey> {
    let Some(ref encoded) = global.key else {
        bail!("An encryption key is required: pass --key or set PDF2INVOICE_KEY (see `pdf2invoice keygen`)");
    };
    EncryptionKey::from_base64(encoded).map_err(|e| anyhow::anyhow!("Invalid encryption key: {e}"))
}

fn open_store(global: &GlobalArgs) -> Result<SqliteStore> {
    let key = key_from(global)?;
    SqliteStore::open(&global.db, &key)
        .with_context(|| format!("Failed to open queue database {}", global.db.display()))
}

/// Map CLI args to `PipelineConfig`.
fn build_config(
    global: &GlobalArgs,
    workers: Option<(usize, u64)>,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .extraction_concurrency(global.concurrency)
        .max_retries(global.max_retries)
        .api_timeout_secs(global.api_timeout)
        .download_timeout_secs(global.download_timeout);

    if let Some((workers, poll_ms)) = workers {
        builder = builder
            .workers(workers)
            .poll_interval_ms(poll_ms)
            .encryption_key(key_from(global)?);
    }
    if let Some(ref model) = global.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = global.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
async fn wait_for(store: &SqliteStore, id: &TaskId) -> Result<()> {
    loop {
        let info = store.get_status(id).await?;
        match info.status {
            TaskStatus::Completed => {
                let result = store.get_result(id).await?;
                return print_result(&result);
            }
            TaskStatus::Failed => bail!(
                "Task {} failed: {}",
                id,
                info.error.unwrap_or_else(|| "unknown error".into())
            ),
            TaskStatus::Pending | TaskStatus::Processing => {
                tokio::time::sleep(Duration::from_millis(500)).await
            }
        }
    }
}

fn print_result(result: &TaskResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialise result")?;
    println!("{json}");
    Ok(())
}
