//! Concrete steps of the patent pipeline and the orchestrators built from them.
//!
//! ```text
//! check_patents ─▶ extract_texts ─▶ collect_documents ─▶ process_documents ─▶ save_results
//!  (registry)        (pdfium)         (parse .txt)         (per document,       (JSON + CSV)
//!                                                           streaming)
//! ```
//!
//! Every step is idempotent, so re-running one after a crash is harmless:
//! existing PDFs and text files are skipped, documents already listed in
//! `processed_documents` are not processed again, and exports overwrite.

use crate::checkpoint::CheckpointStore;
use crate::config::ExtractionConfig;
use crate::context::Context;
use crate::error::ExtractError;
use crate::orchestrator::Orchestrator;
use crate::output::{Document, DocumentResult, Interaction, Page, PageResult};
use crate::pipeline::export::{export_document, ExportPaths};
use crate::pipeline::page::PageExtractionPipeline;
use crate::pipeline::ocr::VisionOcr;
use crate::pipeline::roles::{resolve_provider, LlmRoleRunner, RoleRunner};
use crate::pipeline::text::{list_pdfs, read_document, ExtractionResults, PdfTextExtractor, TextExtractor};
use crate::progress::ProgressCallback;
use crate::registry::{pdf_path, PatentRegistry, PatentsViewRegistry};
use crate::step::{ContextStream, PipelineStep, Step, StreamingStep};
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Context keys ─────────────────────────────────────────────────────────

/// Directory holding the patent PDFs (`PathBuf`).
pub const DOCUMENTS_PATH: &str = "documents_path";
/// Output of `extract_texts` ([`ExtractionResults`]).
pub const EXTRACTION_RESULTS: &str = "extraction_results";
/// Names of the collected documents, new ones first (`Vec<String>`).
pub const ALL_DOCUMENTS: &str = "all_documents";
/// Paths of the collected documents, same order (`Vec<PathBuf>`).
pub const DOCUMENT_PATHS: &str = "document_paths";
/// Names of documents already processed (`Vec<String>`).
pub const PROCESSED_DOCUMENTS: &str = "processed_documents";
/// Result per processed document (`BTreeMap<String, ProcessedDocument>`).
pub const DOCUMENT_RESULTS: &str = "document_results";
/// CSV files written by `save_results` (`Vec<PathBuf>`).
pub const SAVED_RESULTS: &str = "saved_results";

/// What the context keeps of one processed document.
///
/// Page text stays out of the context so the checkpoint written after each
/// document does not grow with the text of every earlier one.
/// `save_results` reads the text back from the raw text file at `path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub path: PathBuf,
    pub pages: Vec<ProcessedPage>,
}

/// Accepted interactions of one page, keyed by page number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedPage {
    pub number: u32,
    pub interactions: Vec<Interaction>,
}

impl ProcessedDocument {
    pub fn new(path: &Path, result: DocumentResult) -> Self {
        Self {
            path: path.to_path_buf(),
            pages: result
                .pages
                .into_iter()
                .map(|p| ProcessedPage {
                    number: p.page.number,
                    interactions: p.interactions,
                })
                .collect(),
        }
    }

    pub fn interaction_count(&self) -> usize {
        self.pages.iter().map(|p| p.interactions.len()).sum()
    }

    /// Rebuild the full result with page text taken from `document`.
    /// A page the document no longer has comes back empty.
    pub fn restore(self, document: &Document) -> DocumentResult {
        DocumentResult {
            pages: self
                .pages
                .into_iter()
                .map(|p| PageResult {
                    page: document
                        .page(p.number)
                        .cloned()
                        .unwrap_or_else(|| Page::new(p.number, "")),
                    interactions: p.interactions,
                })
                .collect(),
        }
    }
}

/// Context every orchestrator built here starts from.
pub fn initial_context(config: &ExtractionConfig) -> Result<Context, ExtractError> {
    Context::new().with(DOCUMENTS_PATH, &config.documents_dir)
}

// ── check_patents ────────────────────────────────────────────────────────

/// Tops the documents directory up to `patents_per_batch` PDFs.
pub struct CheckPatentsStep {
    registry: Option<Arc<dyn PatentRegistry>>,
    patents_per_batch: usize,
    search_query: String,
}

impl CheckPatentsStep {
    pub fn new(config: &ExtractionConfig, registry: Option<Arc<dyn PatentRegistry>>) -> Self {
        Self {
            registry,
            patents_per_batch: config.patents_per_batch,
            search_query: config.search_query.clone(),
        }
    }

    async fn download(
        &self,
        registry: &dyn PatentRegistry,
        shortfall: usize,
        dir: &Path,
    ) -> Result<usize, ExtractError> {
        let ids = registry.search(&self.search_query, self.patents_per_batch).await?;
        let mut fetched = 0;
        for id in ids {
            if fetched >= shortfall {
                break;
            }
            if pdf_path(dir, &id).exists() {
                debug!("{} already present", id);
                continue;
            }
            if registry.fetch(&id, dir).await? {
                fetched += 1;
            } else {
                warn!("Could not download patent {}", id);
            }
        }
        Ok(fetched)
    }
}

#[async_trait]
impl Step for CheckPatentsStep {
    fn name(&self) -> &str {
        "check_patents"
    }

    fn requires(&self) -> &[&'static str] {
        &[DOCUMENTS_PATH]
    }

    async fn execute(&self, context: Context) -> Result<Context, ExtractError> {
        let dir: PathBuf = context.require(DOCUMENTS_PATH, self.name())?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ExtractError::WriteFailed {
                path: dir.clone(),
                source,
            })?;

        let present = list_pdfs(&dir).await?.len();
        if present >= self.patents_per_batch {
            info!("{} patents found, no download needed", present);
            return Ok(context);
        }

        let shortfall = self.patents_per_batch - present;
        info!(
            "{} patents found, downloading {} more ('{}')",
            present, shortfall, self.search_query
        );
        let registry = self
            .registry
            .as_deref()
            .ok_or(ExtractError::RegistryKeyMissing)?;
        let fetched = self.download(registry, shortfall, &dir).await?;
        if fetched < shortfall {
            warn!("Downloaded {} of {} missing patents", fetched, shortfall);
        } else {
            info!("Downloaded {} patents", fetched);
        }
        Ok(context)
    }
}

// ── extract_texts ────────────────────────────────────────────────────────

/// Turns every PDF into a page-divided text file.
pub struct ExtractTextsStep {
    extractor: Arc<dyn TextExtractor>,
}

impl ExtractTextsStep {
    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Step for ExtractTextsStep {
    fn name(&self) -> &str {
        "extract_texts"
    }

    fn requires(&self) -> &[&'static str] {
        &[DOCUMENTS_PATH]
    }

    fn produces(&self) -> &[&'static str] {
        &[EXTRACTION_RESULTS]
    }

    async fn execute(&self, mut context: Context) -> Result<Context, ExtractError> {
        let dir: PathBuf = context.require(DOCUMENTS_PATH, self.name())?;
        let results = self.extractor.extract_texts(&dir).await?;
        info!(
            "Extracted {} texts ({} new) in {:.2}s",
            results.count_total, results.count_new, results.elapsed_secs
        );
        context.insert(EXTRACTION_RESULTS, &results)?;
        Ok(context)
    }
}

// ── collect_documents ────────────────────────────────────────────────────

/// Parses the extracted text files and lists them for processing.
pub struct CollectDocumentsStep;

#[async_trait]
impl Step for CollectDocumentsStep {
    fn name(&self) -> &str {
        "collect_documents"
    }

    fn requires(&self) -> &[&'static str] {
        &[EXTRACTION_RESULTS]
    }

    fn produces(&self) -> &[&'static str] {
        &[ALL_DOCUMENTS, DOCUMENT_PATHS]
    }

    async fn execute(&self, mut context: Context) -> Result<Context, ExtractError> {
        let results: ExtractionResults = context.require(EXTRACTION_RESULTS, self.name())?;

        let mut seen = HashSet::new();
        let mut names = Vec::new();
        let mut paths = Vec::new();
        let candidates = results
            .new_outputs
            .iter()
            .map(|p| (p, true))
            .chain(results.already_done_outputs.iter().map(|p| (p, false)));

        for (path, is_new) in candidates {
            let document = read_document(path).await?;
            if !seen.insert(document.name.clone()) {
                continue;
            }
            info!(
                "{} {} ({} pages)",
                if is_new { "+" } else { " " },
                document.name,
                document.len()
            );
            names.push(document.name);
            paths.push(path.clone());
        }

        info!("Collected {} documents", names.len());
        context.insert(ALL_DOCUMENTS, &names)?;
        context.insert(DOCUMENT_PATHS, &paths)?;
        Ok(context)
    }
}

// ── process_documents ────────────────────────────────────────────────────

/// Runs the page pipeline over each unprocessed document, yielding after each.
pub struct ProcessDocumentsStep {
    pipeline: PageExtractionPipeline,
    progress: Option<ProgressCallback>,
}

/// Iteration state of one `execute_streaming` call.
struct Pending {
    context: Context,
    queue: VecDeque<PathBuf>,
    index: usize,
    total: usize,
}

impl ProcessDocumentsStep {
    pub fn new(runner: Arc<dyn RoleRunner>, config: &ExtractionConfig) -> Self {
        Self {
            pipeline: PageExtractionPipeline::new(runner, config),
            progress: config.progress_callback.clone(),
        }
    }

    fn pending(&self, context: Context) -> Result<Pending, ExtractError> {
        let paths: Vec<PathBuf> = context.require(DOCUMENT_PATHS, self.name())?;
        let processed: Vec<String> = context.get_or_default(PROCESSED_DOCUMENTS);
        let processed: HashSet<&str> = processed.iter().map(String::as_str).collect();

        let queue: VecDeque<PathBuf> = paths
            .into_iter()
            .filter(|p| !processed.contains(document_name(p).as_str()))
            .collect();
        info!(
            "{} documents to process ({} already done)",
            queue.len(),
            processed.len()
        );

        Ok(Pending {
            total: queue.len(),
            index: 0,
            queue,
            context,
        })
    }

    async fn process_next(&self, state: &mut Pending, path: PathBuf) -> Result<(), ExtractError> {
        let document = read_document(&path).await?;
        info!(
            "Processing document ({}/{}): {}",
            state.index + 1,
            state.total,
            document.name
        );
        if let Some(ref cb) = self.progress {
            cb.on_document_start(&document.name, state.index, state.total, document.len());
        }

        let result = self.pipeline.run_document(&document).await?;

        if let Some(ref cb) = self.progress {
            cb.on_document_complete(&document.name, result.pages.len(), result.interaction_count());
        }

        let mut results: BTreeMap<String, ProcessedDocument> =
            state.context.get_or_default(DOCUMENT_RESULTS);
        results.insert(document.name.clone(), ProcessedDocument::new(&path, result));
        state.context.insert(DOCUMENT_RESULTS, &results)?;

        let mut processed: Vec<String> = state.context.get_or_default(PROCESSED_DOCUMENTS);
        if !processed.contains(&document.name) {
            processed.push(document.name);
        }
        state.context.insert(PROCESSED_DOCUMENTS, &processed)?;

        state.index += 1;
        Ok(())
    }
}

fn document_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl StreamingStep for ProcessDocumentsStep {
    fn name(&self) -> &str {
        "process_documents"
    }

    fn requires(&self) -> &[&'static str] {
        &[DOCUMENT_PATHS]
    }

    fn produces(&self) -> &[&'static str] {
        &[PROCESSED_DOCUMENTS, DOCUMENT_RESULTS]
    }

    fn execute_streaming<'a>(&'a self, context: Context) -> ContextStream<'a> {
        let state = match self.pending(context) {
            Ok(state) => state,
            Err(e) => return Box::pin(stream::once(async move { Err::<Context, _>(e) })),
        };

        Box::pin(stream::try_unfold(state, move |mut state| async move {
            let Some(path) = state.queue.pop_front() else {
                return Ok::<_, ExtractError>(None);
            };
            self.process_next(&mut state, path).await?;
            Ok(Some((state.context.clone(), state)))
        }))
    }
}

// ── save_results ─────────────────────────────────────────────────────────

/// Writes the intermediate JSON and the CSV export of every document result.
pub struct SaveResultsStep {
    intermediate_dir: PathBuf,
    final_dir: PathBuf,
}

impl SaveResultsStep {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            intermediate_dir: config.intermediate_dir.clone(),
            final_dir: config.final_dir.clone(),
        }
    }
}

#[async_trait]
impl Step for SaveResultsStep {
    fn name(&self) -> &str {
        "save_results"
    }

    fn produces(&self) -> &[&'static str] {
        &[SAVED_RESULTS]
    }

    async fn execute(&self, mut context: Context) -> Result<Context, ExtractError> {
        let results: BTreeMap<String, ProcessedDocument> =
            context.get_or_default(DOCUMENT_RESULTS);
        let mut saved = Vec::with_capacity(results.len());

        for (name, processed) in results {
            let document = match read_document(&processed.path).await {
                Ok(document) => document,
                Err(e) => {
                    warn!("{}: page text unavailable, exporting without it: {}", name, e);
                    Document {
                        name: name.clone(),
                        path: processed.path.clone(),
                        pages: Vec::new(),
                    }
                }
            };
            let result = processed.restore(&document);
            let paths = ExportPaths::for_document(&self.intermediate_dir, &self.final_dir, &name);
            export_document(&paths, &result).await?;
            info!(
                "Saved {} ({} interactions) → {}",
                name,
                result.interaction_count(),
                paths.csv.display()
            );
            saved.push(paths.csv);
        }

        if saved.is_empty() {
            info!("No document results to save");
        }
        context.insert(SAVED_RESULTS, &saved)?;
        Ok(context)
    }
}

// ── Factories ────────────────────────────────────────────────────────────

/// External services the steps talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn RoleRunner>,
    pub extractor: Arc<dyn TextExtractor>,
    /// Needed only when PDFs must be downloaded.
    pub registry: Option<Arc<dyn PatentRegistry>>,
}

impl Collaborators {
    /// Production collaborators: LLM roles, pdfium text with vision OCR for
    /// scanned pages, PatentsView (if a key is set).
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let registry: Option<Arc<dyn PatentRegistry>> = match config.registry_api_key {
            Some(ref key) if !key.is_empty() => Some(Arc::new(PatentsViewRegistry::new(key.clone())?)),
            _ => None,
        };
        let provider = resolve_provider(config)?;
        let mut extractor = PdfTextExtractor::new(config);
        if config.ocr_fallback {
            extractor = extractor.with_ocr(Arc::new(VisionOcr::new(Arc::clone(&provider), config)));
        }
        Ok(Self {
            runner: Arc::new(LlmRoleRunner::new(provider, config)),
            extractor: Arc::new(extractor),
            registry,
        })
    }
}

fn with_progress(orchestrator: Orchestrator, config: &ExtractionConfig) -> Orchestrator {
    match config.progress_callback {
        Some(ref cb) => orchestrator.with_progress(Arc::clone(cb)),
        None => orchestrator,
    }
}

/// check → extract → collect → process → save, checkpointed at
/// `config.checkpoint_path`.
pub fn patent_orchestrator(
    config: &ExtractionConfig,
    collaborators: &Collaborators,
) -> Result<Orchestrator, ExtractError> {
    let steps = vec![
        PipelineStep::single(CheckPatentsStep::new(config, collaborators.registry.clone())),
        PipelineStep::single(ExtractTextsStep::new(Arc::clone(&collaborators.extractor))),
        PipelineStep::single(CollectDocumentsStep),
        PipelineStep::streaming(ProcessDocumentsStep::new(
            Arc::clone(&collaborators.runner),
            config,
        )),
        PipelineStep::single(SaveResultsStep::new(config)),
    ];
    let orchestrator = Orchestrator::new(steps, CheckpointStore::new(&config.checkpoint_path))?;
    Ok(with_progress(orchestrator, config))
}

/// extract → collect → process → save over the PDFs already present,
/// checkpointed at `config.documents_checkpoint_path`.
pub fn document_orchestrator(
    config: &ExtractionConfig,
    collaborators: &Collaborators,
) -> Result<Orchestrator, ExtractError> {
    let steps = vec![
        PipelineStep::single(ExtractTextsStep::new(Arc::clone(&collaborators.extractor))),
        PipelineStep::single(CollectDocumentsStep),
        PipelineStep::streaming(ProcessDocumentsStep::new(
            Arc::clone(&collaborators.runner),
            config,
        )),
        PipelineStep::single(SaveResultsStep::new(config)),
    ];
    let orchestrator = Orchestrator::new(
        steps,
        CheckpointStore::new(&config.documents_checkpoint_path),
    )?;
    Ok(with_progress(orchestrator, config))
}
