//! The shared, open-ended context threaded through every pipeline step.
//!
//! Steps communicate only through this map: an earlier step writes
//! `extraction_results`, a later one reads it. Values are stored as
//! `serde_json::Value` so the whole map can be snapshotted into a checkpoint
//! without any step-specific serialisation code.
//!
//! Reads are typed. [`Context::get_or_default`] is the defensive read for
//! keys that may legitimately be absent on a fresh run (e.g. the list of
//! processed documents); [`Context::require`] is for keys whose absence is a
//! pipeline bug.

use crate::error::ExtractError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// String-keyed map of JSON values shared by all steps of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert for constructing initial contexts.
    pub fn with<T: Serialize>(mut self, key: &str, value: T) -> Result<Self, ExtractError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn insert<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), ExtractError> {
        let value = serde_json::to_value(value).map_err(|e| ExtractError::ContextType {
            key: key.to_string(),
            detail: e.to_string(),
        })?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Typed read. `Ok(None)` when absent, `Err` when present with the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ExtractError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| ExtractError::ContextType {
                    key: key.to_string(),
                    detail: e.to_string(),
                }),
        }
    }

    /// Typed read that never fails: absent or mis-shaped values yield `T::default()`.
    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.get(key) {
            Ok(Some(v)) => v,
            Ok(None) => T::default(),
            Err(e) => {
                warn!("Ignoring context value: {}", e);
                T::default()
            }
        }
    }

    /// Typed read of a key that must be present.
    pub fn require<T: DeserializeOwned>(&self, key: &str, step: &str) -> Result<T, ExtractError> {
        self.get(key)?.ok_or_else(|| ExtractError::MissingContextKey {
            step: step.to_string(),
            key: key.to_string(),
        })
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged_with(mut self, other: Context) -> Context {
        self.values.extend(other.values);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_typed_get() {
        let mut ctx = Context::new();
        ctx.insert("processed_documents", vec!["a.txt", "b.txt"]).unwrap();
        let docs: Vec<String> = ctx.get("processed_documents").unwrap().unwrap();
        assert_eq!(docs, vec!["a.txt", "b.txt"]);
        assert!(ctx.get::<Vec<String>>("missing").unwrap().is_none());
    }

    #[test]
    fn wrong_shape_is_an_error_for_get_but_default_for_get_or_default() {
        let ctx = Context::new().with("processed_documents", 42).unwrap();
        assert!(ctx.get::<Vec<String>>("processed_documents").is_err());
        let docs: Vec<String> = ctx.get_or_default("processed_documents");
        assert!(docs.is_empty());
    }

    #[test]
    fn require_names_step_and_key() {
        let ctx = Context::new();
        let err = ctx.require::<String>("current_filename", "save_results").unwrap_err();
        match err {
            ExtractError::MissingContextKey { step, key } => {
                assert_eq!(step, "save_results");
                assert_eq!(key, "current_filename");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn merged_with_prefers_other() {
        let initial = Context::new()
            .with("documents_path", "patents")
            .unwrap()
            .with("batch", 10)
            .unwrap();
        let saved = Context::new().with("batch", 3).unwrap();
        let merged = initial.merged_with(saved);
        assert_eq!(merged.get::<u32>("batch").unwrap(), Some(3));
        assert_eq!(
            merged.get::<String>("documents_path").unwrap().as_deref(),
            Some("patents")
        );
    }

    #[test]
    fn serialises_as_a_plain_object() {
        let ctx = Context::new().with("k", true).unwrap();
        assert_eq!(serde_json::to_string(&ctx).unwrap(), r#"{"k":true}"#);
    }
}
