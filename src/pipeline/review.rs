//! Validate/repair review of a candidate extraction.
//!
//! ## State machine
//!
//! ```text
//!            ┌──────────── repair (≤ max_cycles times) ───────────┐
//!            ▼                                                     │
//!       Proposed ──validate──▶ correct? ──yes──▶ Accepted          │
//!                                 │no                              │
//!                                 ▼                                │
//!                             fixable? ──no──▶ Rejected(Unfixable) │
//!                                 │yes                             │
//!                                 ▼                                │
//!                        repairs left? ──no──▶ Rejected(CyclesExhausted)
//!                                 │yes                             │
//!                                 └────────────────────────────────┘
//! ```
//!
//! The loop is explicit and counted: the validator runs at most
//! `max_cycles + 1` times and the repairer at most `max_cycles` times. An
//! unresolved disagreement fails closed: the page's data is dropped rather
//! than shipped unvalidated.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::{Extraction, Interaction, Verdict};
use crate::pipeline::roles::{call_role, Role, RoleRunner};
use crate::prompts::{repairer_input, validator_input};
use std::sync::Arc;
use tracing::debug;

/// Why a review ended without an accepted extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The validator said the candidate is wrong and cannot be fixed.
    Unfixable { explanation: Option<String> },
    /// Every permitted repair was used and the validator still disagreed.
    CyclesExhausted { cycles: u32 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Unfixable { explanation } => write!(
                f,
                "unfixable: {}",
                explanation.as_deref().unwrap_or("no explanation")
            ),
            RejectReason::CyclesExhausted { cycles } => {
                write!(f, "still incorrect after {cycles} repair cycles")
            }
        }
    }
}

/// Terminal state of a review.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    /// The (possibly repaired) candidate passed validation.
    Accepted(Vec<Interaction>),
    /// Drop this page's extraction.
    Rejected(RejectReason),
}

impl ReviewOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReviewOutcome::Accepted(_))
    }
}

/// Outcome plus the counters of one review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewReport {
    pub outcome: ReviewOutcome,
    pub validator_calls: u32,
    pub repairs: u32,
}

/// Bounded validate/repair loop over one page.
pub struct ReviewLoop {
    runner: Arc<dyn RoleRunner>,
    max_cycles: u32,
    role_attempts: u32,
    retry_backoff_ms: u64,
}

impl ReviewLoop {
    pub fn new(runner: Arc<dyn RoleRunner>, config: &ExtractionConfig) -> Self {
        Self {
            runner,
            max_cycles: config.max_review_cycles,
            role_attempts: config.role_attempts,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    pub fn max_cycles(&self) -> u32 {
        self.max_cycles
    }

    /// Review `candidate` against `page_text`.
    ///
    /// Returns `Err` only when a role call fails on every attempt; a
    /// rejection is a normal [`ReviewOutcome::Rejected`].
    pub async fn review(
        &self,
        page_text: &str,
        candidate: Vec<Interaction>,
    ) -> Result<ReviewReport, ExtractError> {
        let mut candidate = candidate;
        let mut validator_calls = 0;
        let mut repairs = 0;

        loop {
            let candidate_json = candidate_json(&candidate)?;
            let verdict: Verdict = call_role(
                self.runner.as_ref(),
                Role::Validate,
                &validator_input(page_text, &candidate_json),
                self.role_attempts,
                self.retry_backoff_ms,
            )
            .await?;
            validator_calls += 1;

            let outcome = if verdict.is_correct {
                Some(ReviewOutcome::Accepted(std::mem::take(&mut candidate)))
            } else if !verdict.fixable {
                Some(ReviewOutcome::Rejected(RejectReason::Unfixable {
                    explanation: verdict.explanation.clone(),
                }))
            } else if repairs >= self.max_cycles {
                Some(ReviewOutcome::Rejected(RejectReason::CyclesExhausted {
                    cycles: self.max_cycles,
                }))
            } else {
                None
            };

            if let Some(outcome) = outcome {
                return Ok(ReviewReport {
                    outcome,
                    validator_calls,
                    repairs,
                });
            }

            let explanation = verdict.explanation.as_deref().unwrap_or_default();
            debug!(
                "Review cycle {}/{}: repairing ({})",
                repairs + 1,
                self.max_cycles,
                explanation
            );
            let repaired: Extraction = call_role(
                self.runner.as_ref(),
                Role::Repair,
                &repairer_input(page_text, &candidate_json, explanation),
                self.role_attempts,
                self.retry_backoff_ms,
            )
            .await?;
            repairs += 1;
            candidate = repaired.interactions;
        }
    }
}

/// The candidate as the validator and repairer see it.
fn candidate_json(candidate: &[Interaction]) -> Result<String, ExtractError> {
    Ok(serde_json::to_string_pretty(&serde_json::json!({
        "interactions": candidate
    }))?)
}
