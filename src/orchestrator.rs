//! Checkpointed, resumable execution of an ordered list of steps.
//!
//! ## State machine
//!
//! The orchestrator walks step indices `start..N`. `start` is computed from
//! the checkpoint:
//!
//! | Checkpoint | Resume at |
//! |------------|-----------|
//! | none / unreadable | 0 |
//! | step `k` completed | `k + 1` |
//! | streaming step `k` in progress | `k` (same step, restored context) |
//! | name not in this pipeline | 0, restored context discarded |
//!
//! After every completed step the checkpoint is overwritten with the step's
//! name and the new context; streaming steps additionally checkpoint after
//! every yielded snapshot. A checkpoint is only ever written *after* the
//! state it describes exists, so a reader never sees progress that did not
//! happen.
//!
//! ## Endings
//!
//! * all steps done → checkpoint cleared, [`RunOutcome::Completed`]
//! * [`CancellationToken`] fired → stop at the next safe point (before a
//!   step, or after a streaming yield) and keep the checkpoint,
//!   [`RunOutcome::Cancelled`]
//! * a step fails → `Err(ExtractError::StepFailed)`, checkpoint left at the
//!   last successfully completed unit; calling `run` again resumes there

use crate::checkpoint::{CheckpointRecord, CheckpointStore, StepProgress};
use crate::context::Context;
use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use crate::step::PipelineStep;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation flag shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop at its next safe point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How a call to [`Orchestrator::run`] ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Steps `resumed_from..N` ran and the checkpoint was cleared.
    /// `context` is what the final step left behind.
    Completed {
        steps_run: usize,
        resumed_from: usize,
        context: Context,
    },
    /// The checkpoint already recorded the final step as done; nothing ran.
    AlreadyComplete,
    /// Stopped on request. `step` is where the next run resumes and
    /// `units_done` how many of its sub-items are already checkpointed.
    Cancelled { step: String, units_done: usize },
}

/// Where the next run will start.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Index of the first step to execute; equals the step count when there
    /// is nothing left to do.
    pub index: usize,
    /// Sub-items of the step at `index` already completed (streaming only).
    pub units_done: usize,
    /// Context restored from the checkpoint (empty when starting fresh).
    pub restored: Context,
}

impl ResumePoint {
    fn fresh() -> Self {
        Self {
            index: 0,
            units_done: 0,
            restored: Context::new(),
        }
    }
}

/// Drives an ordered list of [`PipelineStep`]s with checkpoint/resume.
pub struct Orchestrator {
    steps: Vec<PipelineStep>,
    store: CheckpointStore,
    progress: Option<ProgressCallback>,
}

impl Orchestrator {
    /// Build an orchestrator. Step names must be unique because they are
    /// the checkpoint keys.
    pub fn new(steps: Vec<PipelineStep>, store: CheckpointStore) -> Result<Self, ExtractError> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.name().to_string()) {
                return Err(ExtractError::DuplicateStep(step.name().to_string()));
            }
        }
        Ok(Self {
            steps,
            store,
            progress: None,
        })
    }

    /// Report run and step events to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Compute where [`Orchestrator::run`] would start, without running.
    pub async fn resume_point(&self) -> ResumePoint {
        self.resume_from(self.store.load().await)
    }

    fn resume_from(&self, record: Option<CheckpointRecord>) -> ResumePoint {
        let Some(record) = record else {
            return ResumePoint::fresh();
        };
        if record.last_completed_step.is_empty() {
            return ResumePoint::fresh();
        }

        match self
            .steps
            .iter()
            .position(|s| s.name() == record.last_completed_step)
        {
            Some(k) => match record.progress {
                StepProgress::Completed => ResumePoint {
                    index: k + 1,
                    units_done: 0,
                    restored: record.context,
                },
                StepProgress::InProgress { units_done } => ResumePoint {
                    index: k,
                    units_done,
                    restored: record.context,
                },
            },
            None => {
                warn!(
                    "Checkpoint names unknown step '{}'; starting from scratch",
                    record.last_completed_step
                );
                ResumePoint::fresh()
            }
        }
    }

    /// Check that every step's required keys are available by the time it runs.
    fn validate_chain(&self, start: usize, context: &Context) -> Result<(), ExtractError> {
        let mut available: HashSet<&str> = context.keys().collect();
        for step in &self.steps[start..] {
            for key in step.requires() {
                if !available.contains(key) {
                    return Err(ExtractError::MissingContextKey {
                        step: step.name().to_string(),
                        key: key.to_string(),
                    });
                }
            }
            available.extend(step.produces().iter().copied());
        }
        Ok(())
    }

    /// Run (or resume) the pipeline.
    ///
    /// `initial` is overlaid with any restored context; restored values win
    /// so a resumed run sees exactly what the interrupted one had.
    pub async fn run(
        &self,
        initial: Context,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ExtractError> {
        let total = self.steps.len();
        info!("Starting orchestrator ({} steps)", total);

        let resume = self.resume_point().await;
        let start = resume.index;

        if start >= total {
            info!("All steps already completed");
            self.store.clear().await?;
            return Ok(RunOutcome::AlreadyComplete);
        }

        let mut context = initial.merged_with(resume.restored);
        self.validate_chain(start, &context)?;

        if start > 0 || resume.units_done > 0 {
            info!(
                "Resuming ({}/{} steps complete, {} sub-items of '{}' complete)",
                start,
                total,
                resume.units_done,
                self.steps[start].name()
            );
        } else {
            info!("Fresh run ({} steps)", total);
        }
        if let Some(ref cb) = self.progress {
            cb.on_run_start(total, start);
        }

        let mut steps_run = 0;
        for (i, step) in self.steps.iter().enumerate().skip(start) {
            let name = step.name();

            if cancel.is_cancelled() {
                warn!("Cancelled before step '{}'", name);
                return Ok(RunOutcome::Cancelled {
                    step: name.to_string(),
                    units_done: 0,
                });
            }

            info!("Step {}/{}: {}", i + 1, total, name);
            if let Some(ref cb) = self.progress {
                cb.on_step_start(name, i, total);
            }

            context = match step {
                PipelineStep::Single(s) => s.execute(context).await.map_err(|e| {
                    error!("Step '{}' failed: {}", name, e);
                    e.in_step(name)
                })?,
                PipelineStep::Streaming(s) => {
                    let mut units = if i == start { resume.units_done } else { 0 };
                    let mut stream = s.execute_streaming(context.clone());
                    while let Some(item) = stream.next().await {
                        context = item.map_err(|e| {
                            error!("Step '{}' failed after {} sub-items: {}", name, units, e);
                            e.in_step(name)
                        })?;
                        units += 1;
                        self.store
                            .save_partial(name, &context, units)
                            .await
                            .map_err(|e| e.in_step(name))?;
                        debug!("Step '{}': {} sub-items checkpointed", name, units);

                        if cancel.is_cancelled() {
                            warn!("Cancelled inside step '{}' after {} sub-items", name, units);
                            return Ok(RunOutcome::Cancelled {
                                step: name.to_string(),
                                units_done: units,
                            });
                        }
                    }
                    context
                }
            };

            self.store
                .save(name, &context)
                .await
                .map_err(|e| e.in_step(name))?;
            steps_run += 1;
            info!("Step '{}' completed", name);
            if let Some(ref cb) = self.progress {
                cb.on_step_complete(name, i, total);
            }
        }

        self.store.clear().await?;
        info!("Run completed ({} steps executed)", steps_run);
        if let Some(ref cb) = self.progress {
            cb.on_run_complete(steps_run);
        }

        Ok(RunOutcome::Completed {
            steps_run,
            resumed_from: start,
            context,
        })
    }

    /// Discard all progress; the next run starts from scratch.
    pub async fn reset(&self) -> Result<(), ExtractError> {
        self.store.clear().await?;
        info!("Progress reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn execute(&self, context: Context) -> Result<Context, ExtractError> {
            Ok(context)
        }
    }

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        Orchestrator::new(
            vec![
                PipelineStep::single(Named("a")),
                PipelineStep::single(Named("b")),
                PipelineStep::single(Named("c")),
            ],
            CheckpointStore::new(dir.path().join("cp.json")),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let err = Orchestrator::new(
            vec![PipelineStep::single(Named("a")), PipelineStep::single(Named("a"))],
            CheckpointStore::new("unused.json"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExtractError::DuplicateStep(n) if n == "a"));
    }

    #[tokio::test]
    async fn resume_point_follows_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        assert_eq!(orch.resume_point().await.index, 0);

        orch.checkpoint_store().save("a", &Context::new()).await.unwrap();
        assert_eq!(orch.resume_point().await.index, 1);

        orch.checkpoint_store()
            .save_partial("b", &Context::new(), 4)
            .await
            .unwrap();
        let rp = orch.resume_point().await;
        assert_eq!((rp.index, rp.units_done), (1, 4));
    }

    #[tokio::test]
    async fn unknown_checkpoint_step_restarts_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let ctx = Context::new().with("stale", true).unwrap();
        orch.checkpoint_store().save("renamed_step", &ctx).await.unwrap();

        let rp = orch.resume_point().await;
        assert_eq!(rp.index, 0);
        assert!(rp.restored.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.checkpoint_store().save("b", &Context::new()).await.unwrap();
        orch.reset().await.unwrap();
        assert_eq!(orch.resume_point().await.index, 0);
    }

    #[test]
    fn cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
