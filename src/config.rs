//! Configuration for extraction runs.
//!
//! Every knob lives in [`ExtractionConfig`], built via its
//! [`ExtractionConfigBuilder`]: review budgets, the relevance threshold, the
//! LLM provider, and the on-disk layout (documents, raw text, results,
//! checkpoints).

use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Model used when a provider is named but no model is.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Configuration for an extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use patent_ligands::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .max_review_cycles(3)
///     .relevance_threshold(0.6)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Maximum validate/repair cycles per page. Default: 2.
    ///
    /// The validator runs at most `max_review_cycles + 1` times per page and
    /// the repairer at most `max_review_cycles` times.
    pub max_review_cycles: u32,

    /// Calls per role invocation before the failure becomes fatal. Default: 3.
    ///
    /// Counts every call, the first included: 3 means one call plus at most
    /// two retries.
    pub role_attempts: u32,

    /// Minimum search-role confidence for a page to be extracted. Default: 0.5.
    ///
    /// Inclusive: a page at exactly the threshold is extracted.
    pub relevance_threshold: f64,

    /// LLM model identifier. If None, uses [`DEFAULT_MODEL`] or the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per role call. Default: 4096.
    pub max_tokens: usize,

    /// Initial retry delay after a transport error, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Directory holding the patent PDFs. Default: `patents`.
    pub documents_dir: PathBuf,

    /// Directory for page-divided raw text files. Default: `results/raw`.
    pub raw_text_dir: PathBuf,

    /// Directory for full-fidelity JSON document results. Default: `results/intermediate`.
    pub intermediate_dir: PathBuf,

    /// Directory for flattened CSV exports. Default: `results/final`.
    pub final_dir: PathBuf,

    /// Checkpoint file of the patent orchestrator. Default: `checkpoints/patents.json`.
    pub checkpoint_path: PathBuf,

    /// Checkpoint file of the document orchestrator. Default: `checkpoints/documents.json`.
    pub documents_checkpoint_path: PathBuf,

    /// Number of PDFs that should exist locally before extraction. Default: 10.
    pub patents_per_batch: usize,

    /// Registry search query used to top up the documents directory.
    /// Default: "protein binding".
    pub search_query: String,

    /// PatentsView API key; required only when PDFs must be downloaded.
    pub registry_api_key: Option<String>,

    /// PDFs with more pages than this are not extracted. Default: 50.
    pub pages_limit: usize,

    /// Concurrent PDF text extractions. Default: min(CPU count, 4).
    pub text_workers: usize,

    /// OCR pages that have no text layer through the vision model. Default: true.
    pub ocr_fallback: bool,

    /// Longest edge, in pixels, of a page rasterised for OCR. Default: 2000.
    ///
    /// Capping pixels instead of DPI keeps memory bounded for oversized pages.
    pub ocr_max_pixels: u32,

    /// Page and document events.
    pub progress_callback: Option<ProgressCallback>,
}

/// min(available CPUs, 4)
pub fn default_text_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_review_cycles: 2,
            role_attempts: 3,
            relevance_threshold: 0.5,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            retry_backoff_ms: 500,
            documents_dir: PathBuf::from("patents"),
            raw_text_dir: PathBuf::from("results/raw"),
            intermediate_dir: PathBuf::from("results/intermediate"),
            final_dir: PathBuf::from("results/final"),
            checkpoint_path: PathBuf::from("checkpoints/patents.json"),
            documents_checkpoint_path: PathBuf::from("checkpoints/documents.json"),
            patents_per_batch: 10,
            search_query: "protein binding".to_string(),
            registry_api_key: None,
            pages_limit: 50,
            text_workers: default_text_workers(),
            ocr_fallback: true,
            ocr_max_pixels: 2000,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_review_cycles", &self.max_review_cycles)
            .field("role_attempts", &self.role_attempts)
            .field("relevance_threshold", &self.relevance_threshold)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("documents_dir", &self.documents_dir)
            .field("raw_text_dir", &self.raw_text_dir)
            .field("intermediate_dir", &self.intermediate_dir)
            .field("final_dir", &self.final_dir)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("patents_per_batch", &self.patents_per_batch)
            .field("registry_api_key", &self.registry_api_key.as_ref().map(|_| "***"))
            .field("pages_limit", &self.pages_limit)
            .field("text_workers", &self.text_workers)
            .field("ocr_fallback", &self.ocr_fallback)
            .field("ocr_max_pixels", &self.ocr_max_pixels)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Point every output location under one root directory:
    /// `{root}/results/{raw,intermediate,final}` and `{root}/checkpoints/`.
    pub fn rooted_at(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.raw_text_dir = root.join("results/raw");
        self.intermediate_dir = root.join("results/intermediate");
        self.final_dir = root.join("results/final");
        self.checkpoint_path = root.join("checkpoints/patents.json");
        self.documents_checkpoint_path = root.join("checkpoints/documents.json");
        self
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn max_review_cycles(mut self, n: u32) -> Self {
        self.config.max_review_cycles = n;
        self
    }

    pub fn role_attempts(mut self, n: u32) -> Self {
        self.config.role_attempts = n.max(1);
        self
    }

    pub fn relevance_threshold(mut self, t: f64) -> Self {
        self.config.relevance_threshold = t;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn documents_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.documents_dir = dir.into();
        self
    }

    pub fn raw_text_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.raw_text_dir = dir.into();
        self
    }

    pub fn intermediate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.intermediate_dir = dir.into();
        self
    }

    pub fn final_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.final_dir = dir.into();
        self
    }

    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = path.into();
        self
    }

    pub fn documents_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.documents_checkpoint_path = path.into();
        self
    }

    pub fn output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config = self.config.rooted_at(root);
        self
    }

    pub fn patents_per_batch(mut self, n: usize) -> Self {
        self.config.patents_per_batch = n;
        self
    }

    pub fn search_query(mut self, query: impl Into<String>) -> Self {
        self.config.search_query = query.into();
        self
    }

    pub fn registry_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.registry_api_key = Some(key.into());
        self
    }

    pub fn pages_limit(mut self, n: usize) -> Self {
        self.config.pages_limit = n;
        self
    }

    pub fn text_workers(mut self, n: usize) -> Self {
        self.config.text_workers = n.max(1);
        self
    }

    pub fn ocr_fallback(mut self, enabled: bool) -> Self {
        self.config.ocr_fallback = enabled;
        self
    }

    pub fn ocr_max_pixels(mut self, px: u32) -> Self {
        self.config.ocr_max_pixels = px.clamp(256, 8000);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.relevance_threshold) {
            return Err(ExtractError::InvalidConfig(format!(
                "Relevance threshold must be within 0–1, got {}",
                c.relevance_threshold
            )));
        }
        if c.role_attempts == 0 {
            return Err(ExtractError::InvalidConfig(
                "Role attempts must be ≥ 1".into(),
            ));
        }
        if c.text_workers == 0 {
            return Err(ExtractError::InvalidConfig(
                "Text workers must be ≥ 1".into(),
            ));
        }
        if c.pages_limit == 0 {
            return Err(ExtractError::InvalidConfig(
                "Pages limit must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_review_policy() {
        let c = ExtractionConfig::default();
        assert_eq!(c.max_review_cycles, 2);
        assert_eq!(c.role_attempts, 3);
        assert_eq!(c.relevance_threshold, 0.5);
        assert_eq!(c.pages_limit, 50);
        assert!((1..=4).contains(&c.text_workers));
        assert!(c.ocr_fallback);
        assert_eq!(c.ocr_max_pixels, 2000);
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let err = ExtractionConfig::builder()
            .relevance_threshold(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn setters_clamp() {
        let c = ExtractionConfig::builder()
            .role_attempts(0)
            .text_workers(0)
            .temperature(9.0)
            .ocr_max_pixels(10)
            .build()
            .unwrap();
        assert_eq!(c.ocr_max_pixels, 256);
        assert_eq!(c.role_attempts, 1);
        assert_eq!(c.text_workers, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn output_root_moves_every_artifact() {
        let c = ExtractionConfig::builder().output_root("/work").build().unwrap();
        assert_eq!(c.raw_text_dir, PathBuf::from("/work/results/raw"));
        assert_eq!(c.final_dir, PathBuf::from("/work/results/final"));
        assert_eq!(c.checkpoint_path, PathBuf::from("/work/checkpoints/patents.json"));
    }

    #[test]
    fn debug_hides_api_key() {
        let c = ExtractionConfig::builder()
            .registry_api_key("secret-key")
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret-key"));
    }
}
