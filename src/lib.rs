//! # patent-ligands
//!
//! Extract ligand–protein interactions and their binding parameters (Ki, IC50,
//! Kd, EC50) from patent documents, with resumable, LLM-reviewed pipelines.
//!
//! ## Why this crate?
//!
//! A single LLM pass over a patent page produces plausible-looking tables that
//! are often wrong: values in µM instead of nM, IC50 confused with Ki, ligands
//! that do not appear in the text. This crate runs every relevant page through
//! an extractor and then a validator/repairer loop with a hard cycle bound, so
//! a page either ends with a reviewed result or is explicitly rejected.
//!
//! Patent batches take hours. Every step checkpoints its output, streaming
//! steps checkpoint after each document, and a crashed or cancelled run
//! resumes where it stopped.
//!
//! ## Pipeline Overview
//!
//! ```text
//! patents/*.pdf
//!  │
//!  ├─ 1. check_patents      top up the batch from PatentsView (optional)
//!  ├─ 2. extract_texts      PDF text layer (or vision OCR of scans) → results/raw/*.txt  (pdfium)
//!  ├─ 3. collect_documents  parse "=== PAGE n ===" files
//!  ├─ 4. process_documents  per page: search → extract → validate ⇄ repair
//!  └─ 5. save_results       results/intermediate/*.json + results/final/*.csv
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use patent_ligands::{
//!     document_orchestrator, initial_context, CancellationToken, Collaborators,
//!     ExtractionConfig, RunOutcome,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let collaborators = Collaborators::from_config(&config)?;
//!     let orchestrator = document_orchestrator(&config, &collaborators)?;
//!
//!     let outcome = orchestrator
//!         .run(initial_context(&config)?, &CancellationToken::new())
//!         .await?;
//!     if let RunOutcome::Completed { steps_run, .. } = outcome {
//!         eprintln!("{steps_run} steps run");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `patent-ligands` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! patent-ligands = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod registry;
pub mod step;
pub mod steps;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{CheckpointRecord, CheckpointStore, StepProgress};
pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use context::Context;
pub use error::{ExtractError, RoleError};
pub use orchestrator::{CancellationToken, Orchestrator, ResumePoint, RunOutcome};
pub use output::{
    Document, DocumentResult, Interaction, InteractionParameters, Page, PageResult,
};
pub use pipeline::ocr::{PageOcr, VisionOcr};
pub use pipeline::page::{PageExtractionPipeline, PageOutcome};
pub use pipeline::review::{RejectReason, ReviewLoop, ReviewOutcome};
pub use pipeline::roles::{LlmRoleRunner, Role, RoleRunner};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use registry::{PatentRegistry, PatentsViewRegistry};
pub use step::{PipelineStep, Step, StreamingStep};
pub use steps::{
    document_orchestrator, initial_context, patent_orchestrator, Collaborators, ProcessedDocument,
};
