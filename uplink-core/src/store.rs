//! Server-held key/value store with per-write change records.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::diff::structural_diff;
use crate::hash::content_hash;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to hash store value: {0}")]
    Hash(#[from] serde_json::Error),
}

/// One accepted write, ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreUpdate {
    pub key: String,
    /// Structural patch from the previous value to the new one.
    pub diff: Value,
    /// Hash of the value the patch applies on top of.
    pub previous_hash: String,
    /// The value as stored, echoed back to the writer.
    pub value: Value,
}

/// Key/value map plus the hash of each key's last published value.
#[derive(Debug, Default)]
pub struct Store {
    values: HashMap<String, Value>,
    hashes: HashMap<String, String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `key` and produce the update record to publish.
    ///
    /// A key that was never written diffs against the empty object, so the
    /// first record for a key is a patch from `{}`. On error the store is
    /// left untouched and nothing may be published.
    pub fn set(&mut self, key: &str, value: Value) -> Result<StoreUpdate, StoreError> {
        let previous = self
            .values
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let previous_hash = match self.hashes.get(key) {
            Some(hash) => hash.clone(),
            None => content_hash(&previous)?,
        };
        let diff = structural_diff(&previous, &value);
        let hash = content_hash(&value)?;
        self.values.insert(key.to_string(), value.clone());
        self.hashes.insert(key.to_string(), hash);
        Ok(StoreUpdate {
            key: key.to_string(),
            diff,
            previous_hash,
            value,
        })
    }

    /// Current value of `key`, if it was ever written.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Hash of the last published value for `key`.
    pub fn hash(&self, key: &str) -> Option<&str> {
        self.hashes.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}
