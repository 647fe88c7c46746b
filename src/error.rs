//! Error types for the patent-ligands library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractError`] is **fatal**: the current run cannot proceed (I/O
//!   failure, a role that kept failing after its retry budget, a step that
//!   blew up, a misconfigured pipeline). Returned as `Err(ExtractError)` from
//!   every fallible library entry point.
//!
//! * [`RoleError`] is **per call**: a single role invocation failed. The
//!   caller retries it within the attempt budget and only then escalates to
//!   [`ExtractError::RoleFailed`].
//!
//! Two outcomes that look like failures are deliberately *not* errors:
//! a review that ends Rejected (see [`crate::pipeline::review::ReviewOutcome`])
//! and a cancelled run (see [`crate::orchestrator::RunOutcome`]).

use crate::pipeline::roles::Role;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the patent-ligands library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Orchestration errors ──────────────────────────────────────────────
    /// A step returned an error; the checkpoint still points at the last
    /// successfully completed unit.
    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<ExtractError>,
    },

    /// A step needs a context key that nothing upstream provides.
    #[error("Step '{step}' requires context key '{key}', which is neither in the initial context nor produced by an earlier step")]
    MissingContextKey { step: String, key: String },

    /// A context value exists but does not have the expected shape.
    #[error("Context key '{key}' has an unexpected shape: {detail}")]
    ContextType { key: String, detail: String },

    /// Two steps share a name, which would make checkpoints ambiguous.
    #[error("Duplicate step name '{0}' in pipeline definition")]
    DuplicateStep(String),

    // ── Role errors ───────────────────────────────────────────────────────
    /// A role call failed on every attempt of its budget.
    #[error("{role} role failed after {attempts} attempts: {detail}")]
    RoleFailed {
        role: Role,
        attempts: u32,
        detail: String,
    },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// The documents directory does not exist.
    #[error("Documents directory not found: '{path}'")]
    DirectoryNotFound { path: PathBuf },

    /// pdfium could not open or read a PDF.
    #[error("Failed to read text from '{path}': {detail}")]
    PdfText { path: PathBuf, detail: String },

    /// A registry or download request failed.
    #[error("Patent registry request failed: {0}")]
    Registry(String),

    /// Patent search needs an API key and none was provided.
    #[error("Patent registry API key is not set.\nProvide it with --registry-api-key or PATENTSVIEW_API_KEY.")]
    RegistryKeyMissing,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not read an input file.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write an output file.
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialisation of a persisted artifact failed.
    #[error("Serialisation failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    /// Wrap an error with the name of the step it escaped from.
    pub fn in_step(self, step: impl Into<String>) -> Self {
        match self {
            // Already attributed; don't nest.
            e @ ExtractError::StepFailed { .. } => e,
            e => ExtractError::StepFailed {
                step: step.into(),
                source: Box::new(e),
            },
        }
    }
}

/// Failure of a single role invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleError {
    /// The role answered, but not in the structure it was asked for.
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    /// The call never produced an answer (network, rate limit, server error).
    #[error("transport error: {0}")]
    Transport(String),

    /// The role has no backing model; retrying cannot help.
    #[error("role not configured: {0}")]
    NotConfigured(String),
}

impl RoleError {
    /// Whether waiting before the next attempt is worthwhile.
    pub fn wants_backoff(&self) -> bool {
        matches!(self, RoleError::Transport(_))
    }

    /// Whether another attempt could possibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RoleError::NotConfigured(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failed_display_names_step_and_reason() {
        let e = ExtractError::Internal("disk on fire".into()).in_step("save_results");
        let msg = e.to_string();
        assert!(msg.contains("save_results"), "got: {msg}");
        assert!(msg.contains("disk on fire"), "got: {msg}");
    }

    #[test]
    fn in_step_does_not_nest() {
        let e = ExtractError::Internal("x".into())
            .in_step("inner")
            .in_step("outer");
        match e {
            ExtractError::StepFailed { step, .. } => assert_eq!(step, "inner"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn role_failed_display() {
        let e = ExtractError::RoleFailed {
            role: Role::Validate,
            attempts: 3,
            detail: "malformed output: expected bool".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("validate"), "got: {msg}");
        assert!(msg.contains("3 attempts"), "got: {msg}");
    }

    #[test]
    fn only_transport_errors_back_off() {
        assert!(RoleError::Transport("503".into()).wants_backoff());
        assert!(!RoleError::MalformedOutput("not json".into()).wants_backoff());
        assert!(!RoleError::NotConfigured("no model".into()).is_retryable());
    }

    #[test]
    fn missing_key_display() {
        let e = ExtractError::MissingContextKey {
            step: "collect_documents".into(),
            key: "extraction_results".into(),
        };
        assert!(e.to_string().contains("extraction_results"));
    }
}
