//! Units of work driven by the [`crate::orchestrator::Orchestrator`].
//!
//! A [`Step`] takes the shared [`Context`] and returns an updated one. A
//! [`StreamingStep`] does the same over a collection of sub-items (e.g. one
//! document at a time) and yields a context snapshot after each, so the
//! orchestrator can checkpoint *inside* a long step.
//!
//! Both kinds declare the context keys they read ([`Step::requires`]) and
//! write ([`Step::produces`]); the orchestrator checks the chain before it
//! runs anything.
//!
//! Every implementation must be idempotent: a crash can make the
//! orchestrator re-run a step (or the unfinished tail of a streaming step)
//! on the context of the last checkpoint.

use crate::context::Context;
use crate::error::ExtractError;
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// A boxed stream of context snapshots, one per completed sub-item.
pub type ContextStream<'a> = Pin<Box<dyn Stream<Item = Result<Context, ExtractError>> + Send + 'a>>;

/// A named transformation of the shared context.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name; used as the checkpoint key, so renaming a step
    /// invalidates existing checkpoints.
    fn name(&self) -> &str;

    /// Context keys this step reads.
    fn requires(&self) -> &[&'static str] {
        &[]
    }

    /// Context keys this step writes.
    fn produces(&self) -> &[&'static str] {
        &[]
    }

    async fn execute(&self, context: Context) -> Result<Context, ExtractError>;
}

/// A step that reports progress once per sub-item.
pub trait StreamingStep: Send + Sync {
    fn name(&self) -> &str;

    fn requires(&self) -> &[&'static str] {
        &[]
    }

    fn produces(&self) -> &[&'static str] {
        &[]
    }

    /// Lazily process sub-items, yielding the updated context after each.
    ///
    /// The stream is consumed strictly in order. An `Err` item ends the step;
    /// snapshots yielded before it have already been checkpointed.
    fn execute_streaming<'a>(&'a self, context: Context) -> ContextStream<'a>;
}

/// Either kind of step, as held by the orchestrator.
pub enum PipelineStep {
    Single(Box<dyn Step>),
    Streaming(Box<dyn StreamingStep>),
}

impl PipelineStep {
    pub fn single(step: impl Step + 'static) -> Self {
        PipelineStep::Single(Box::new(step))
    }

    pub fn streaming(step: impl StreamingStep + 'static) -> Self {
        PipelineStep::Streaming(Box::new(step))
    }

    pub fn name(&self) -> &str {
        match self {
            PipelineStep::Single(s) => s.name(),
            PipelineStep::Streaming(s) => s.name(),
        }
    }

    pub fn requires(&self) -> &[&'static str] {
        match self {
            PipelineStep::Single(s) => s.requires(),
            PipelineStep::Streaming(s) => s.requires(),
        }
    }

    pub fn produces(&self) -> &[&'static str] {
        match self {
            PipelineStep::Single(s) => s.produces(),
            PipelineStep::Streaming(s) => s.produces(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, PipelineStep::Streaming(_))
    }
}

impl std::fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStep")
            .field("name", &self.name())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}
