//! Typed data model: pages, interactions, and per-page / per-document results.
//!
//! Every field has an explicit type and an explicit optional/default, so
//! downstream consumers (the CSV export, the intermediate record, any UI)
//! never need to look up attributes at run time.
//!
//! Role outputs ([`SearchDecision`], [`Extraction`], [`Verdict`]) are also
//! defined here because they are the structured answers the LLM roles are
//! asked to produce; their serde shape *is* the wire contract.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Documents ────────────────────────────────────────────────────────────

/// One text unit of a document, carrying a stable page number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number as printed by the text extractor.
    pub number: u32,
    /// Trimmed page text.
    pub text: String,
    /// `true` when the trimmed text is empty.
    pub is_empty: bool,
    /// Character count of the trimmed text.
    pub length: usize,
}

impl Page {
    /// Build a page from raw text; the text is trimmed and measured here so
    /// `is_empty` and `length` can never disagree with `text`.
    pub fn new(number: u32, text: &str) -> Self {
        let text = text.trim().to_string();
        Self {
            number,
            is_empty: text.is_empty(),
            length: text.chars().count(),
            text,
        }
    }
}

/// An ordered sequence of pages identified by name.
///
/// Page numbers are strictly increasing but may skip (a page whose text
/// could not be read gets no divider).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// File name of the raw text file, e.g. `US1234567.txt`.
    pub name: String,
    /// Where the raw text was read from.
    pub path: PathBuf,
    pub pages: Vec<Page>,
}

impl Document {
    /// Look a page up by its page number (not its index).
    pub fn page(&self, number: u32) -> Option<&Page> {
        self.pages
            .binary_search_by_key(&number, |p| p.number)
            .ok()
            .map(|i| &self.pages[i])
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

// ── Interactions ─────────────────────────────────────────────────────────

/// Binding-affinity parameters of one interaction.
///
/// All values are in **nanomolar**; this is a hard contract shared with the
/// extractor and repairer prompts. Values must be copied from the source
/// text, never computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionParameters {
    #[serde(rename = "Ki", default)]
    pub ki: Option<f64>,
    #[serde(rename = "IC50", default)]
    pub ic50: Option<f64>,
    #[serde(rename = "Kd", default)]
    pub kd: Option<f64>,
    #[serde(rename = "EC50", default)]
    pub ec50: Option<f64>,
}

impl InteractionParameters {
    /// Iterate `(name, value)` pairs in export column order.
    pub fn named(&self) -> [(&'static str, Option<f64>); 4] {
        [
            ("Ki", self.ki),
            ("IC50", self.ic50),
            ("Kd", self.kd),
            ("EC50", self.ec50),
        ]
    }

    /// `true` when no parameter is present.
    pub fn is_empty(&self) -> bool {
        self.named().iter().all(|(_, v)| v.is_none())
    }

    /// Reject negative or non-finite values.
    pub fn check(&self) -> Result<(), String> {
        for (name, value) in self.named() {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{name} must be a non-negative number, got {v}"));
                }
            }
        }
        Ok(())
    }
}

/// One extracted ligand–protein relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub ligand: String,
    pub protein: String,
    /// e.g. "binding", "inhibition".
    pub interaction_type: String,
    /// Verbatim excerpt of the page text describing the interaction.
    pub context: String,
    #[serde(default)]
    pub parameters: InteractionParameters,
}

// ── Role outputs ─────────────────────────────────────────────────────────

/// Answer of the search role: does this page describe interactions at all?
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchDecision {
    pub does_contain_interactions: bool,
    /// Confidence in `[0, 1]`. Older prompts called this `accuracy`.
    #[serde(alias = "accuracy")]
    pub confidence: f64,
}

/// Answer of the extractor and repairer roles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

impl Extraction {
    /// Structural checks the type system cannot express.
    pub fn check(&self) -> Result<(), String> {
        for (i, interaction) in self.interactions.iter().enumerate() {
            interaction
                .parameters
                .check()
                .map_err(|e| format!("interaction {i}: {e}"))?;
        }
        Ok(())
    }
}

/// Answer of the validator role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_correct: bool,
    pub fixable: bool,
    #[serde(default)]
    pub explanation: Option<String>,
}

// ── Results ──────────────────────────────────────────────────────────────

/// Accepted interactions of one page.
///
/// Only pages that passed the relevance filter *and* review get a
/// `PageResult`; an empty `interactions` list therefore means "reviewed and
/// accepted as having none", which is different from "no PageResult".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub page: Page,
    pub interactions: Vec<Interaction>,
}

/// All page results of one document, in ascending page order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    #[serde(rename = "interactions")]
    pub pages: Vec<PageResult>,
}

impl DocumentResult {
    /// Total interactions across all pages.
    pub fn interaction_count(&self) -> usize {
        self.pages.iter().map(|p| p.interactions.len()).sum()
    }
}
