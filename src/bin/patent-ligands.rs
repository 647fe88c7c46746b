//! CLI binary for patent-ligands.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, wires Ctrl-C to the run's cancellation token, and
//! prints results.

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use patent_ligands::pipeline::export::{read_intermediate, to_csv, write_csv};
use patent_ligands::pipeline::text::read_document;
use patent_ligands::{
    document_orchestrator, initial_context, patent_orchestrator, CancellationToken, CheckpointStore,
    Collaborators, ExtractionConfig, ExtractionProgressCallback, Orchestrator, ProgressCallback,
    RunOutcome,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar over documents, the current page in the
/// message, and a log line per finished document or rejected page.
struct CliProgressCallback {
    bar: ProgressBar,
    interactions: AtomicUsize,
    rejected: AtomicUsize,
    started: Instant,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            interactions: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            started: Instant::now(),
        })
    }

    /// Switch to the full bar once the document count is known.
    fn activate_bar(&self, total_docs: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:36.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(total_docs as u64);
        self.bar.set_style(style);
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_steps: usize, resumed_from: usize) {
        if resumed_from > 0 {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("Resuming at step {}/{}", resumed_from + 1, total_steps))
            ));
        }
    }

    fn on_step_start(&self, step: &str, index: usize, total_steps: usize) {
        self.bar.set_prefix(format!("[{}/{}] {}", index + 1, total_steps, step));
        self.bar.set_message("");
    }

    fn on_document_start(&self, name: &str, index: usize, total_docs: usize, total_pages: usize) {
        if self.bar.length() != Some(total_docs as u64) {
            self.activate_bar(total_docs);
        }
        self.bar.set_position(index as u64);
        self.bar.set_message(format!("{name} ({total_pages} pages)"));
    }

    fn on_page_start(&self, page_num: u32, total_pages: usize) {
        self.bar.set_message(format!("page {page_num} of {total_pages}"));
    }

    fn on_page_complete(&self, _page_num: u32, interactions: usize) {
        self.interactions.fetch_add(interactions, Ordering::Relaxed);
    }

    fn on_page_skipped(&self, page_num: u32, reason: &str) {
        if reason.starts_with("rejected") {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.bar.println(format!(
                "    {} page {:>3}  {}",
                yellow("⚠"),
                page_num,
                dim(reason)
            ));
        }
    }

    fn on_document_complete(&self, name: &str, pages: usize, interactions: usize) {
        self.bar.inc(1);
        self.bar.println(format!(
            "  {} {:<28}  {}  {}",
            green("✓"),
            name,
            dim(&format!("{pages:>3} pages")),
            dim(&format!("{interactions:>4} interactions")),
        ));
    }

    fn on_run_complete(&self, steps_run: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} steps run  {} interactions  {} pages rejected  {}",
            green("✔"),
            bold(&steps_run.to_string()),
            bold(&self.interactions.load(Ordering::Relaxed).to_string()),
            self.rejected.load(Ordering::Relaxed),
            dim(&format!("{:.1}s", self.started.elapsed().as_secs_f64())),
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Download up to 10 patents, extract, review, export
  patent-ligands run --patents-per-batch 10

  # Process the PDFs already in ./patents only
  patent-ligands documents

  # Start over (drop the checkpoint)
  patent-ligands reset
  patent-ligands reset --documents

  # Re-export a saved intermediate record to CSV
  patent-ligands export results/intermediate/US1234567.txt.json -o out.csv

  # List the pages parsed from a raw text file
  patent-ligands inspect results/raw/US1234567.txt

RESUMING:
  Every step is checkpointed; document processing checkpoints after each
  document. Press Ctrl-C to stop at the next safe point, then run the same
  command again to continue where it stopped.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PATENTSVIEW_API_KEY     PatentsView search key (only needed to download)
  PDFIUM_LIB_PATH         Path to an existing libpdfium
"#;

/// Extract ligand–protein interactions from patent documents.
#[derive(Parser, Debug)]
#[command(
    name = "patent-ligands",
    version,
    about = "Extract ligand–protein interactions from patent documents",
    long_about = "Extract ligand–protein interactions and binding parameters (Ki, IC50, Kd, EC50) \
from patent PDFs. Every relevant page goes through an LLM extractor and a bounded \
validator/repairer review; runs are checkpointed and resume after a crash or Ctrl-C.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory for results/ and checkpoints/.
    #[arg(long, global = true, env = "PATENT_LIGANDS_ROOT")]
    root: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, global = true, env = "PATENT_LIGANDS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PATENT_LIGANDS_VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Top up the patent batch, then extract, review and export.
    Run(PipelineArgs),
    /// Extract, review and export the PDFs already present.
    Documents(PipelineArgs),
    /// Delete the saved checkpoint so the next run starts fresh.
    Reset {
        /// Reset the `documents` checkpoint instead of the `run` one.
        #[arg(long)]
        documents: bool,
    },
    /// Write the CSV table of a saved intermediate record.
    Export {
        /// Intermediate JSON written by a previous run.
        input: PathBuf,
        /// Write CSV to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the pages parsed from a page-divided text file.
    Inspect {
        input: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Directory holding the patent PDFs.
    #[arg(long, env = "PATENT_LIGANDS_DOCUMENTS_DIR", default_value = "patents")]
    documents_dir: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Repair rounds allowed per page before rejecting it.
    #[arg(long, env = "PATENT_LIGANDS_MAX_REVIEW_CYCLES", default_value_t = 2)]
    max_review_cycles: u32,

    /// Attempts per role call (malformed output and transport errors).
    #[arg(long, env = "PATENT_LIGANDS_ROLE_ATTEMPTS", default_value_t = 3)]
    role_attempts: u32,

    /// Minimum search confidence for a page to be extracted (0.0–1.0).
    #[arg(long, env = "PATENT_LIGANDS_RELEVANCE_THRESHOLD", default_value_t = 0.5)]
    relevance_threshold: f64,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PATENT_LIGANDS_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Max LLM output tokens per role call.
    #[arg(long, env = "PATENT_LIGANDS_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Base delay of the transport-error backoff, in milliseconds.
    #[arg(long, env = "PATENT_LIGANDS_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Number of PDFs the batch is topped up to (`run` only).
    #[arg(long, env = "PATENT_LIGANDS_PATENTS_PER_BATCH", default_value_t = 10)]
    patents_per_batch: usize,

    /// Registry search phrase (`run` only).
    #[arg(long, env = "PATENT_LIGANDS_SEARCH_QUERY", default_value = "protein binding")]
    search_query: String,

    /// PatentsView API key (`run` only, needed to download).
    #[arg(long, env = "PATENTSVIEW_API_KEY", hide_env_values = true)]
    registry_api_key: Option<String>,

    /// Skip PDFs with more pages than this.
    #[arg(long, env = "PATENT_LIGANDS_PAGES_LIMIT", default_value_t = 50)]
    pages_limit: usize,

    /// Concurrent PDF text extractions (default: min(CPU count, 4)).
    #[arg(long, env = "PATENT_LIGANDS_TEXT_WORKERS")]
    text_workers: Option<usize>,

    /// Leave pages without a text layer out instead of OCR-ing them.
    #[arg(long, env = "PATENT_LIGANDS_NO_OCR")]
    no_ocr: bool,

    /// Longest edge in pixels of a page rendered for OCR.
    #[arg(long, env = "PATENT_LIGANDS_OCR_MAX_PIXELS", default_value_t = 2000)]
    ocr_max_pixels: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs when it is shown.
    let runs_pipeline = matches!(cli.command, Command::Run(_) | Command::Documents(_));
    let show_progress = runs_pipeline && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if show_progress {
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

    match cli.command {
        Command::Run(ref args) => run_pipeline(&cli, args, PipelineKind::Patents, show_progress).await,
        Command::Documents(ref args) => {
            run_pipeline(&cli, args, PipelineKind::Documents, show_progress).await
        }
        Command::Reset { documents } => reset(&cli, documents).await,
        Command::Export { ref input, ref output } => export(input, output.as_ref()).await,
        Command::Inspect { ref input } => inspect(input).await,
    }
}

#[derive(Debug, Clone, Copy)]
enum PipelineKind {
    Patents,
    Documents,
}

async fn run_pipeline(
    cli: &Cli,
    args: &PipelineArgs,
    kind: PipelineKind,
    show_progress: bool,
) -> Result<()> {
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(cli, args, progress)?;

    let collaborators =
        Collaborators::from_config(&config).context("Failed to set up LLM provider")?;
    let orchestrator: Orchestrator = match kind {
        PipelineKind::Patents => patent_orchestrator(&config, &collaborators)?,
        PipelineKind::Documents => document_orchestrator(&config, &collaborators)?,
    };

    // ── Ctrl-C → cancel at the next safe point ───────────────────────────
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} stopping after the current step or document…", yellow("⏸"));
            signal_token.cancel();
        }
    });

    let outcome = orchestrator
        .run(initial_context(&config)?, &token)
        .await
        .context("Pipeline failed; run the same command again to resume")?;

    match outcome {
        RunOutcome::Completed {
            steps_run,
            resumed_from,
            ..
        } => {
            if !show_progress {
                eprintln!(
                    "{} {} steps run (resumed at step {})",
                    green("✔"),
                    steps_run,
                    resumed_from + 1
                );
            }
            eprintln!("   results in {}", bold(&config.final_dir.display().to_string()));
        }
        RunOutcome::AlreadyComplete => {
            eprintln!("{} previous run had already finished; nothing to do", green("✔"));
        }
        RunOutcome::Cancelled { step, units_done } => {
            eprintln!(
                "{} {}; run the same command to resume",
                yellow("⏸"),
                cancelled_at(&bold(&step), units_done)
            );
        }
    }
    Ok(())
}

/// Where a cancelled run stopped. Only the streaming step yields sub-items,
/// so zero means the run stopped on a step boundary.
fn cancelled_at(step: &str, units_done: usize) -> String {
    match units_done {
        0 => format!("cancelled before {step}"),
        1 => format!("cancelled during {step} (1 document checkpointed)"),
        n => format!("cancelled during {step} ({n} documents checkpointed)"),
    }
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(
    cli: &Cli,
    args: &PipelineArgs,
    progress: Option<ProgressCallback>,
) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .documents_dir(&args.documents_dir)
        .max_review_cycles(args.max_review_cycles)
        .role_attempts(args.role_attempts)
        .relevance_threshold(args.relevance_threshold)
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .retry_backoff_ms(args.retry_backoff_ms)
        .patents_per_batch(args.patents_per_batch)
        .search_query(&args.search_query)
        .pages_limit(args.pages_limit)
        .ocr_fallback(!args.no_ocr)
        .ocr_max_pixels(args.ocr_max_pixels);

    if let Some(ref root) = cli.root {
        builder = builder.output_root(root);
    }
    if let Some(n) = args.text_workers {
        builder = builder.text_workers(n);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref key) = args.registry_api_key {
        builder = builder.registry_api_key(key);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn root_config(cli: &Cli) -> ExtractionConfig {
    match cli.root {
        Some(ref root) => ExtractionConfig::default().rooted_at(root),
        None => ExtractionConfig::default(),
    }
}

async fn reset(cli: &Cli, documents: bool) -> Result<()> {
    let config = root_config(cli);
    let path = if documents {
        &config.documents_checkpoint_path
    } else {
        &config.checkpoint_path
    };
    let store = CheckpointStore::new(path);
    match store.last_step_name().await {
        Some(step) => {
            store.clear().await.context("Failed to delete checkpoint")?;
            eprintln!("{} cleared checkpoint (was at '{}')", green("✔"), step);
        }
        None => eprintln!("{}", dim("no checkpoint to clear")),
    }
    Ok(())
}

async fn export(input: &PathBuf, output: Option<&PathBuf>) -> Result<()> {
    let result = read_intermediate(input)
        .await
        .with_context(|| format!("Failed to read intermediate record {:?}", input))?;

    match output {
        Some(path) => {
            write_csv(path, &result)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            eprintln!(
                "{} {} interactions  →  {}",
                green("✔"),
                result.interaction_count(),
                bold(&path.display().to_string())
            );
        }
        None => {
            io::stdout()
                .lock()
                .write_all(to_csv(&result).as_bytes())
                .context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

async fn inspect(input: &PathBuf) -> Result<()> {
    let document = read_document(input)
        .await
        .with_context(|| format!("Failed to read {:?}", input))?;

    println!("Document:  {}", document.name);
    println!("Pages:     {}", document.len());
    for page in &document.pages {
        let preview: String = page.text.chars().take(60).collect::<String>().replace('\n', " ");
        if page.is_empty {
            println!("  {:>4}  {:>6}  {}", page.number, 0, red("(empty)"));
        } else {
            println!("  {:>4}  {:>6}  {}", page.number, page.length, dim(&preview));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_message_depends_on_step_kind() {
        assert_eq!(cancelled_at("extract_texts", 0), "cancelled before extract_texts");
        assert_eq!(
            cancelled_at("process_documents", 1),
            "cancelled during process_documents (1 document checkpointed)"
        );
        assert_eq!(
            cancelled_at("process_documents", 3),
            "cancelled during process_documents (3 documents checkpointed)"
        );
    }
}
