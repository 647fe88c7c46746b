//! Durable single-record checkpoint store.
//!
//! The store holds exactly one [`CheckpointRecord`]: the name of the last
//! unit of work that finished, plus a snapshot of the [`Context`] at that
//! moment. The orchestrator overwrites it after every completed step (and
//! after every yielded sub-item of a streaming step), reads it once at the
//! start of a run, and clears it when the run finishes.
//!
//! ## Format
//!
//! Pretty-printed JSON. Writes go to a sibling `*.tmp` file first and are
//! then renamed over the real file, so a crash mid-write leaves either the
//! previous record or the new one, never a torn file. A file that does not
//! parse anyway (hand-edited, truncated by a full disk, written by an
//! incompatible version) loads as *absent*: the run restarts from the
//! beginning instead of failing.

use crate::context::Context;
use crate::error::ExtractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How far the recorded step got.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepProgress {
    /// The step ran to completion.
    #[default]
    Completed,
    /// A streaming step yielded `units_done` sub-items but has not finished.
    InProgress { units_done: usize },
}

/// One persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Name of the step this record describes; empty for "none yet".
    pub last_completed_step: String,
    #[serde(default)]
    pub progress: StepProgress,
    pub context: Context,
    pub timestamp: DateTime<Utc>,
}

/// File-backed store of a single [`CheckpointRecord`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store the record at `path`. Nothing is touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// One store per key inside `dir`, for callers that run several
    /// documents in parallel and therefore cannot share one record.
    pub fn keyed(dir: impl AsRef<Path>, key: &str) -> Self {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = if safe.is_empty() { "_".to_string() } else { safe };
        Self::new(dir.as_ref().join(format!("{safe}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `step_name` completed with `context`.
    pub async fn save(&self, step_name: &str, context: &Context) -> Result<(), ExtractError> {
        self.write(step_name, StepProgress::Completed, context).await
    }

    /// Record that streaming step `step_name` has finished `units_done`
    /// sub-items; a resumed run re-enters the same step.
    pub async fn save_partial(
        &self,
        step_name: &str,
        context: &Context,
        units_done: usize,
    ) -> Result<(), ExtractError> {
        self.write(step_name, StepProgress::InProgress { units_done }, context)
            .await
    }

    async fn write(
        &self,
        step_name: &str,
        progress: StepProgress,
        context: &Context,
    ) -> Result<(), ExtractError> {
        let record = CheckpointRecord {
            last_completed_step: step_name.to_string(),
            progress,
            context: context.clone(),
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.write_err(e))?;
            }
        }

        // Atomic write: write to temp, then rename
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| self.write_err(e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.write_err(e))?;

        debug!(
            "Checkpoint saved: step='{}' progress={:?}",
            step_name, progress
        );
        Ok(())
    }

    /// The most recent record, or `None` if there is none or it is unreadable.
    pub async fn load(&self) -> Option<CheckpointRecord> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    "Checkpoint '{}' unreadable, ignoring: {}",
                    self.path.display(),
                    e
                );
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    "Checkpoint '{}' is corrupt, ignoring: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Remove the record. A missing record is not an error.
    pub async fn clear(&self) -> Result<(), ExtractError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.write_err(e)),
        }
    }

    /// Name of the recorded step, if any.
    pub async fn last_step_name(&self) -> Option<String> {
        self.load()
            .await
            .map(|r| r.last_completed_step)
            .filter(|name| !name.is_empty())
    }

    /// Context snapshot of the recorded step; empty if there is none.
    pub async fn saved_context(&self) -> Context {
        self.load().await.map(|r| r.context).unwrap_or_default()
    }

    fn write_err(&self, source: std::io::Error) -> ExtractError {
        ExtractError::WriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("nested/dir/orchestrator.json"))
    }

    #[tokio::test]
    async fn load_is_absent_before_first_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load().await.is_none());
        assert!(store.last_step_name().await.is_none());
        assert!(store.saved_context().await.is_empty());
    }

    #[tokio::test]
    async fn save_creates_directories_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let ctx = Context::new().with("processed_documents", vec!["a.txt"]).unwrap();

        store.save("extract_texts", &ctx).await.unwrap();

        let record = store.load().await.unwrap();
        assert_eq!(record.last_completed_step, "extract_texts");
        assert_eq!(record.progress, StepProgress::Completed);
        assert_eq!(record.context, ctx);
        assert_eq!(store.last_step_name().await.as_deref(), Some("extract_texts"));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn save_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save("a", &Context::new()).await.unwrap();
        store.save_partial("b", &Context::new(), 2).await.unwrap();

        let record = store.load().await.unwrap();
        assert_eq!(record.last_completed_step, "b");
        assert_eq!(record.progress, StepProgress::InProgress { units_done: 2 });
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        std::fs::write(store.path(), b"{\"last_completed_step\": \"trunc").unwrap();
        assert!(store.load().await.is_none());
        assert!(store.saved_context().await.is_empty());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.clear().await.unwrap();
        store.save("a", &Context::new()).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[test]
    fn keyed_sanitises_file_name() {
        let store = CheckpointStore::keyed("/tmp/cps", "US 123/456.txt");
        assert_eq!(store.path(), Path::new("/tmp/cps/US_123_456.txt.json"));
    }
}
