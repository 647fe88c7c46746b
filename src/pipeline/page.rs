//! Per-page decision procedure and its fold into a document result.
//!
//! For every page, in ascending page order:
//!
//! 1. **Empty**: a page with no text is skipped without any role call.
//! 2. **Relevance**: the search role answers `{does_contain_interactions,
//!    confidence}`; the page continues only if the flag is set *and*
//!    `confidence >= relevance_threshold` (exactly at the threshold passes).
//! 3. **Extraction**: the extractor role proposes interactions.
//! 4. **Review**: [`ReviewLoop`] accepts or rejects the proposal.
//!
//! Only step 4's `Accepted` produces a [`PageResult`], possibly with zero
//! interactions. Every skip produces nothing, which keeps "reviewed, none
//! found" distinguishable from "not extracted" downstream.
//!
//! Pages are processed strictly sequentially: one page's role calls never
//! overlap another's.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::{Document, DocumentResult, Extraction, Page, PageResult, SearchDecision};
use crate::pipeline::review::{RejectReason, ReviewLoop, ReviewOutcome};
use crate::pipeline::roles::{call_role, Role, RoleOutput, RoleRunner};
use crate::progress::ProgressCallback;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// No text; no role was called.
    Empty,
    /// The relevance filter turned the page down.
    NotRelevant(SearchDecision),
    /// Review rejected the extraction.
    Rejected(RejectReason),
    /// Review accepted the extraction.
    Accepted(PageResult),
}

impl PageOutcome {
    /// Short human-readable reason for a skipped page.
    pub fn skip_reason(&self) -> Option<String> {
        match self {
            PageOutcome::Empty => Some("empty page".to_string()),
            PageOutcome::NotRelevant(d) => Some(format!(
                "not relevant (contains={}, confidence={:.2})",
                d.does_contain_interactions, d.confidence
            )),
            PageOutcome::Rejected(reason) => Some(format!("rejected: {reason}")),
            PageOutcome::Accepted(_) => None,
        }
    }

    pub fn into_result(self) -> Option<PageResult> {
        match self {
            PageOutcome::Accepted(r) => Some(r),
            _ => None,
        }
    }
}

/// The relevance rule: flag set and confidence at or above `threshold`.
pub fn is_relevant(decision: &SearchDecision, threshold: f64) -> bool {
    decision.does_contain_interactions && decision.confidence >= threshold
}

/// Relevance filter, extractor, and review composed per page.
pub struct PageExtractionPipeline {
    runner: Arc<dyn RoleRunner>,
    review: ReviewLoop,
    relevance_threshold: f64,
    role_attempts: u32,
    retry_backoff_ms: u64,
    progress: Option<ProgressCallback>,
}

impl PageExtractionPipeline {
    pub fn new(runner: Arc<dyn RoleRunner>, config: &ExtractionConfig) -> Self {
        Self {
            review: ReviewLoop::new(Arc::clone(&runner), config),
            runner,
            relevance_threshold: config.relevance_threshold,
            role_attempts: config.role_attempts,
            retry_backoff_ms: config.retry_backoff_ms,
            progress: config.progress_callback.clone(),
        }
    }

    /// Run the full procedure on one page.
    pub async fn process_page(&self, page: &Page) -> Result<PageOutcome, ExtractError> {
        if page.is_empty {
            debug!("Page {}: empty, skipped", page.number);
            return Ok(PageOutcome::Empty);
        }

        let decision: SearchDecision = self.call(Role::Search, &page.text).await?;
        if !is_relevant(&decision, self.relevance_threshold) {
            debug!(
                "Page {}: not relevant (contains={}, confidence={:.2})",
                page.number, decision.does_contain_interactions, decision.confidence
            );
            return Ok(PageOutcome::NotRelevant(decision));
        }

        let extraction: Extraction = self.call(Role::Extract, &page.text).await?;
        debug!(
            "Page {}: {} candidate interactions",
            page.number,
            extraction.interactions.len()
        );

        let report = self.review.review(&page.text, extraction.interactions).await?;
        match report.outcome {
            ReviewOutcome::Accepted(interactions) => {
                debug!(
                    "Page {}: accepted {} interactions after {} validations",
                    page.number,
                    interactions.len(),
                    report.validator_calls
                );
                Ok(PageOutcome::Accepted(PageResult {
                    page: page.clone(),
                    interactions,
                }))
            }
            ReviewOutcome::Rejected(reason) => {
                warn!("Page {}: extraction rejected, {}", page.number, reason);
                Ok(PageOutcome::Rejected(reason))
            }
        }
    }

    /// Process every page of `document` in order and fold the accepted ones.
    pub async fn run_document(&self, document: &Document) -> Result<DocumentResult, ExtractError> {
        let total = document.len();
        let mut result = DocumentResult::default();

        for page in &document.pages {
            if let Some(ref cb) = self.progress {
                cb.on_page_start(page.number, total);
            }

            let outcome = self.process_page(page).await?;
            if let Some(ref cb) = self.progress {
                match outcome.skip_reason() {
                    Some(reason) => cb.on_page_skipped(page.number, &reason),
                    None => {
                        if let PageOutcome::Accepted(ref r) = outcome {
                            cb.on_page_complete(page.number, r.interactions.len());
                        }
                    }
                }
            }
            if let Some(page_result) = outcome.into_result() {
                result.pages.push(page_result);
            }
        }

        info!(
            "Document '{}': {} of {} pages kept, {} interactions",
            document.name,
            result.pages.len(),
            total,
            result.interaction_count()
        );
        Ok(result)
    }

    async fn call<T: RoleOutput>(
        &self,
        role: Role,
        input: &str,
    ) -> Result<T, ExtractError> {
        call_role(
            self.runner.as_ref(),
            role,
            input,
            self.role_attempts,
            self.retry_backoff_ms,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoleError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Per-role answer queues.
    #[derive(Default)]
    struct Script {
        answers: Mutex<HashMap<Role, VecDeque<Value>>>,
        calls: Mutex<Vec<Role>>,
    }

    impl Script {
        fn with(self, role: Role, answers: Vec<Value>) -> Self {
            self.answers
                .lock()
                .unwrap()
                .entry(role)
                .or_default()
                .extend(answers);
            self
        }

        fn count(&self, role: Role) -> usize {
            self.calls.lock().unwrap().iter().filter(|r| **r == role).count()
        }
    }

    #[async_trait]
    impl RoleRunner for Script {
        async fn run(&self, role: Role, _input: &str) -> Result<Value, RoleError> {
            self.calls.lock().unwrap().push(role);
            self.answers
                .lock()
                .unwrap()
                .get_mut(&role)
                .and_then(|q| q.pop_front())
                .ok_or_else(|| RoleError::Transport(format!("no scripted {role} answer")))
        }
    }

    fn search(contains: bool, confidence: f64) -> Value {
        json!({"does_contain_interactions": contains, "confidence": confidence})
    }

    fn one_kd_interaction() -> Value {
        json!({"interactions": [{
            "ligand": "compound 7", "protein": "BTK", "interaction_type": "binding",
            "context": "compound 7 binds BTK (Kd = 10 nM)",
            "parameters": {"Ki": null, "IC50": null, "Kd": 10.0, "EC50": null}
        }]})
    }

    fn accept() -> Value {
        json!({"is_correct": true, "fixable": false})
    }

    fn pipeline(script: Arc<Script>) -> PageExtractionPipeline {
        let config = ExtractionConfig::builder().retry_backoff_ms(1).build().unwrap();
        PageExtractionPipeline::new(script, &config)
    }

    fn doc(pages: &[(u32, &str)]) -> Document {
        Document {
            name: "US1.txt".into(),
            path: PathBuf::from("US1.txt"),
            pages: pages.iter().map(|(n, t)| Page::new(*n, t)).collect(),
        }
    }

    #[test]
    fn relevance_tie_break_is_inclusive() {
        let at = SearchDecision { does_contain_interactions: true, confidence: 0.5 };
        let below = SearchDecision { does_contain_interactions: true, confidence: 0.49 };
        let unflagged = SearchDecision { does_contain_interactions: false, confidence: 1.0 };
        assert!(is_relevant(&at, 0.5));
        assert!(!is_relevant(&below, 0.5));
        assert!(!is_relevant(&unflagged, 0.5));
    }

    #[tokio::test]
    async fn empty_page_makes_no_role_calls() {
        let script = Arc::new(Script::default());
        let outcome = pipeline(script.clone())
            .process_page(&Page::new(1, "   \n "))
            .await
            .unwrap();
        assert_eq!(outcome, PageOutcome::Empty);
        assert!(script.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn confidence_at_threshold_is_extracted() {
        let script = Arc::new(
            Script::default()
                .with(Role::Search, vec![search(true, 0.5)])
                .with(Role::Extract, vec![one_kd_interaction()])
                .with(Role::Validate, vec![accept()]),
        );
        let outcome = pipeline(script.clone())
            .process_page(&Page::new(1, "text"))
            .await
            .unwrap();
        assert!(matches!(outcome, PageOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn confidence_below_threshold_skips_extraction() {
        let script = Arc::new(Script::default().with(Role::Search, vec![search(true, 0.49)]));
        let outcome = pipeline(script.clone())
            .process_page(&Page::new(1, "text"))
            .await
            .unwrap();
        assert!(matches!(outcome, PageOutcome::NotRelevant(_)));
        assert_eq!(script.count(Role::Extract), 0);
    }

    #[tokio::test]
    async fn rejected_review_emits_no_page_result() {
        let script = Arc::new(
            Script::default()
                .with(Role::Search, vec![search(true, 0.9)])
                .with(Role::Extract, vec![one_kd_interaction()])
                .with(
                    Role::Validate,
                    vec![json!({"is_correct": false, "fixable": false, "explanation": "dates"})],
                ),
        );
        let result = pipeline(script).run_document(&doc(&[(1, "text")])).await.unwrap();
        assert!(result.pages.is_empty());
    }

    #[tokio::test]
    async fn accepted_empty_extraction_is_kept() {
        let script = Arc::new(
            Script::default()
                .with(Role::Search, vec![search(true, 0.7)])
                .with(Role::Extract, vec![json!({"interactions": []})])
                .with(Role::Validate, vec![accept()]),
        );
        let result = pipeline(script).run_document(&doc(&[(4, "text")])).await.unwrap();
        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.pages[0].page.number, 4);
        assert!(result.pages[0].interactions.is_empty());
    }

    #[tokio::test]
    async fn document_result_follows_page_order() {
        let script = Arc::new(
            Script::default()
                .with(Role::Search, vec![search(true, 0.9), search(false, 0.9), search(true, 0.8)])
                .with(Role::Extract, vec![one_kd_interaction(), one_kd_interaction()])
                .with(Role::Validate, vec![accept(), accept()]),
        );
        let document = doc(&[(1, "a"), (2, "b"), (3, ""), (5, "c")]);
        let result = pipeline(script.clone()).run_document(&document).await.unwrap();

        let numbers: Vec<u32> = result.pages.iter().map(|p| p.page.number).collect();
        assert_eq!(numbers, vec![1, 5]);
        assert_eq!(result.interaction_count(), 2);
        assert_eq!(script.count(Role::Search), 3);
    }

    #[tokio::test]
    async fn empty_document_yields_empty_result() {
        let script = Arc::new(Script::default());
        let result = pipeline(script).run_document(&doc(&[])).await.unwrap();
        assert!(result.pages.is_empty());
    }

    #[tokio::test]
    async fn role_failure_propagates() {
        let script = Arc::new(Script::default());
        let err = pipeline(script)
            .run_document(&doc(&[(1, "text")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::RoleFailed { role: Role::Search, .. }));
    }
}
