//! Per-document extraction stages.
//!
//! Each submodule implements one transformation. They are wired together by
//! the steps in [`crate::steps`], but every stage is usable (and tested) on
//! its own.
//!
//! ## Data Flow
//!
//! ```text
//! text ──▶ page ──────────────────────────────▶ export
//! (pdfium,  (search → extract → review)         (JSON + CSV)
//!  dividers)            │
//!   │                   └─▶ review (validate ⇄ repair, bounded)
//!   └─▶ ocr (scanned pages only)
//! ```
//!
//! 1. [`text`]  : PDF text layer to `=== PAGE n ===` files and back; pdfium
//!    runs in `spawn_blocking` because it is not async-safe
//!    - [`ocr`] : scanned pages as PNG through the vision model
//! 2. [`roles`] : the four LLM roles, JSON reply parsing, retry/backoff, and
//!    provider resolution; the only stage with LLM network I/O
//! 3. [`review`]: the validator/repairer loop with its cycle bound
//! 4. [`page`]  : relevance gate, extraction, review, per-page outcome
//! 5. [`export`]: atomic writes of the intermediate JSON and the CSV table

pub mod export;
pub mod ocr;
pub mod page;
pub mod review;
pub mod roles;
pub mod text;
