//! Page-divided raw text: format, parsing, and extraction from PDFs.
//!
//! ## Format
//!
//! A raw text file holds the pages of one patent, each introduced by a
//! divider line:
//!
//! ```text
//! === PAGE 1 ===
//! ...text of page 1...
//!
//! === PAGE 3 ===
//! ...text of page 3...
//! ```
//!
//! Only pages with text get a divider, so numbers may skip. Parsing is the
//! inverse: a line that is exactly a divider with a larger number than the
//! previous one starts a new page, anything before the first divider is
//! ignored, and a divider followed by no lines at all yields no page.
//!
//! ## Scanned pages
//!
//! A page whose text layer is empty is rasterised and, when a [`PageOcr`]
//! is attached, transcribed by it. Pages that still have no text after
//! that get no divider.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; calling it from a Tokio
//! worker would stall the runtime. Each PDF is read on the blocking pool,
//! at most `text_workers` at a time. OCR calls happen after the blocking
//! read, on the async side.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::{Document, Page};
use crate::pipeline::ocr::{encode_page, recognize_page, PageOcr};
use async_trait::async_trait;
use edgequake_llm::ImageData;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

static DIVIDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^=== PAGE (\d+) ===$").unwrap());

/// The divider line that introduces page `number`.
pub fn page_divider(number: u32) -> String {
    format!("=== PAGE {number} ===")
}

/// Parse page-divided text into pages.
pub fn parse_pages(text: &str) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut current: Option<u32> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let divider = DIVIDER_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok())
            .filter(|&n| n >= 1 && current.map_or(true, |cur| n > cur));

        match divider {
            Some(number) => {
                flush(&mut pages, current, &mut lines);
                current = Some(number);
            }
            None if current.is_some() => lines.push(line),
            None => {}
        }
    }
    flush(&mut pages, current, &mut lines);

    pages
}

fn flush(pages: &mut Vec<Page>, current: Option<u32>, lines: &mut Vec<&str>) {
    if let Some(number) = current {
        if !lines.is_empty() {
            pages.push(Page::new(number, &lines.join("\n")));
        }
    }
    lines.clear();
}

/// Render `(page_number, text)` pairs into the page-divided format.
/// Pages whose trimmed text is empty are left out.
pub fn render_pages(pages: &[(u32, String)]) -> String {
    let mut out = String::new();
    for (number, text) in pages {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        out.push_str(&page_divider(*number));
        out.push('\n');
        out.push_str(text);
        out.push_str("\n\n");
    }
    out
}

/// Read and parse one raw text file.
pub async fn read_document(path: &Path) -> Result<Document, ExtractError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ExtractError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pages = parse_pages(&text);
    debug!("Parsed '{}': {} pages", name, pages.len());
    Ok(Document {
        name,
        path: path.to_path_buf(),
        pages,
    })
}

// ── Extraction collaborator ──────────────────────────────────────────────

/// Result of one pass over the documents directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResults {
    /// Text files written by this pass.
    pub new_outputs: Vec<PathBuf>,
    /// Text files that already existed and were left alone.
    pub already_done_outputs: Vec<PathBuf>,
    pub count_new: usize,
    pub count_old: usize,
    pub count_total: usize,
    pub elapsed_secs: f64,
}

/// Turns the PDFs of a directory into page-divided text files.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_texts(&self, documents_dir: &Path) -> Result<ExtractionResults, ExtractError>;
}

/// [`TextExtractor`] reading each page's text layer through pdfium, with
/// OCR for pages that have none.
///
/// Without an attached [`PageOcr`], scanned pages come out empty and get no
/// divider.
#[derive(Clone)]
pub struct PdfTextExtractor {
    raw_text_dir: PathBuf,
    pages_limit: usize,
    workers: usize,
    ocr: Option<Arc<dyn PageOcr>>,
    ocr_max_pixels: u32,
    ocr_attempts: u32,
    retry_backoff_ms: u64,
}

/// Content of one page as read by pdfium.
pub enum PageContent {
    /// Text layer.
    Text(String),
    /// No text layer; the page rendered to a PNG for OCR.
    Scanned(ImageData),
}

/// What reading one PDF produced.
enum PdfText {
    Pages(Vec<(u32, PageContent)>),
    TooLong(usize),
}

impl PdfTextExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            raw_text_dir: config.raw_text_dir.clone(),
            pages_limit: config.pages_limit,
            workers: config.text_workers.max(1),
            ocr: None,
            ocr_max_pixels: config.ocr_max_pixels,
            ocr_attempts: config.role_attempts,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Transcribe pages without a text layer with `ocr`.
    pub fn with_ocr(mut self, ocr: Arc<dyn PageOcr>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Text of every page: the text layer as is, scanned pages through OCR.
    /// A scanned page comes back empty when there is no OCR or it failed.
    pub async fn resolve_pages(&self, pages: Vec<(u32, PageContent)>) -> Vec<(u32, String)> {
        let mut out = Vec::with_capacity(pages.len());
        for (number, content) in pages {
            let text = match content {
                PageContent::Text(text) => text,
                PageContent::Scanned(image) => match self.ocr {
                    Some(ref ocr) => {
                        debug!("Page {}: no text layer, running OCR", number);
                        recognize_page(
                            ocr.as_ref(),
                            number,
                            &image,
                            self.ocr_attempts,
                            self.retry_backoff_ms,
                        )
                        .await
                        .unwrap_or_default()
                    }
                    None => String::new(),
                },
            };
            out.push((number, text));
        }
        out
    }

    /// Where the text of `pdf` is (or will be) written.
    pub fn output_path(&self, pdf: &Path) -> PathBuf {
        let stem = pdf
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.raw_text_dir.join(format!("{stem}.txt"))
    }

    async fn extract_one(&self, pdf: PathBuf) -> Result<Option<PathBuf>, ExtractError> {
        let out = self.output_path(&pdf);
        let limit = self.pages_limit;
        let raster = self.ocr.as_ref().map(|_| self.ocr_max_pixels);
        let src = pdf.clone();

        let text = tokio::task::spawn_blocking(move || read_pdf_text(&src, limit, raster))
            .await
            .map_err(|e| ExtractError::Internal(format!("Text extraction task panicked: {}", e)))??;

        match text {
            PdfText::TooLong(n) => {
                warn!(
                    "Skipping '{}': {} pages exceeds the limit of {}",
                    pdf.display(),
                    n,
                    limit
                );
                Ok(None)
            }
            PdfText::Pages(pages) => {
                let pages = self.resolve_pages(pages).await;
                let body = render_pages(&pages);
                crate::pipeline::export::write_atomic(&out, body.as_bytes()).await?;
                info!("Extracted '{}' → '{}'", pdf.display(), out.display());
                Ok(Some(out))
            }
        }
    }
}

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract_texts(&self, documents_dir: &Path) -> Result<ExtractionResults, ExtractError> {
        let start = Instant::now();
        let pdfs = list_pdfs(documents_dir).await?;

        let (done, pending): (Vec<PathBuf>, Vec<PathBuf>) =
            pdfs.into_iter().partition(|p| self.output_path(p).exists());
        let already_done_outputs: Vec<PathBuf> =
            done.iter().map(|p| self.output_path(p)).collect();

        info!(
            "Text extraction: {} PDFs pending, {} already done ({} workers)",
            pending.len(),
            already_done_outputs.len(),
            self.workers
        );

        let results: Vec<(PathBuf, Result<Option<PathBuf>, ExtractError>)> =
            stream::iter(pending.into_iter().map(|pdf| async move {
                let result = self.extract_one(pdf.clone()).await;
                (pdf, result)
            }))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut new_outputs = Vec::new();
        for (pdf, result) in results {
            match result {
                Ok(Some(out)) => new_outputs.push(out),
                Ok(None) => {}
                Err(e) => warn!("Skipping '{}': {}", pdf.display(), e),
            }
        }
        new_outputs.sort();

        let count_new = new_outputs.len();
        let count_old = already_done_outputs.len();
        Ok(ExtractionResults {
            new_outputs,
            already_done_outputs,
            count_new,
            count_old,
            count_total: count_new + count_old,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}

/// Sorted `*.pdf` files directly inside `dir`.
pub async fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    if !dir.is_dir() {
        return Err(ExtractError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }
    let read_err = |source| ExtractError::ReadFailed {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    let mut pdfs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if is_pdf && path.is_file() {
            pdfs.push(path);
        }
    }
    pdfs.sort();
    Ok(pdfs)
}

/// Bind pdfium: `PDFIUM_LIB_PATH` when set, otherwise the system library.
fn bind_pdfium(pdf_path: &Path) -> Result<Pdfium, ExtractError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(lib) if !lib.is_empty() => Pdfium::bind_to_library(lib),
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| ExtractError::PdfText {
        path: pdf_path.to_path_buf(),
        detail: format!("pdfium library not available: {:?}", e),
    })?;
    Ok(Pdfium::new(bindings))
}

/// Blocking: read every page's text layer. With `raster` set, pages whose
/// text layer is empty are rendered with that longest edge instead.
fn read_pdf_text(
    pdf_path: &Path,
    pages_limit: usize,
    raster: Option<u32>,
) -> Result<PdfText, ExtractError> {
    let pdfium = bind_pdfium(pdf_path)?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| ExtractError::PdfText {
            path: pdf_path.to_path_buf(),
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages > pages_limit {
        return Ok(PdfText::TooLong(total_pages));
    }

    let render_config = raster.map(|px| {
        PdfRenderConfig::new()
            .set_target_width(px as i32)
            .set_maximum_height(px as i32)
    });

    let mut out = Vec::with_capacity(total_pages);
    for idx in 0..total_pages {
        let page = match pages.get(idx as u16) {
            Ok(page) => page,
            Err(e) => {
                warn!("'{}' page {}: {:?}", pdf_path.display(), idx + 1, e);
                continue;
            }
        };
        let text = match page.text() {
            Ok(text) => text.all(),
            Err(e) => {
                warn!("'{}' page {}: no text layer ({:?})", pdf_path.display(), idx + 1, e);
                continue;
            }
        };
        let number = idx as u32 + 1;

        let Some(ref render_config) = render_config else {
            out.push((number, PageContent::Text(text)));
            continue;
        };
        if !text.trim().is_empty() {
            out.push((number, PageContent::Text(text)));
            continue;
        }
        match page.render_with_config(render_config) {
            Ok(bitmap) => match encode_page(&bitmap.as_image()) {
                Ok(image) => out.push((number, PageContent::Scanned(image))),
                Err(e) => warn!("'{}' page {}: encoding failed ({})", pdf_path.display(), number, e),
            },
            Err(e) => warn!("'{}' page {}: render failed ({:?})", pdf_path.display(), number, e),
        };
    }

    debug!("'{}': read {} of {} pages", pdf_path.display(), out.len(), total_pages);
    Ok(PdfText::Pages(out))
}
