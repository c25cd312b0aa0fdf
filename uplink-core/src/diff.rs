//! Structural JSON diff and patch.
//!
//! The patch format is a merge patch in the RFC 7386 style:
//!
//! - Two objects diff member by member; unchanged members are omitted.
//! - A member present before but absent after shows up as `null`, which
//!   [`apply_patch`] treats as a removal.
//! - Arrays, scalars, and mixed-type pairs replace wholesale.
//!
//! The format cannot express "set this member to `null`" distinctly from
//! "remove this member", so an explicit `null` member does not survive a
//! diff/apply round trip. Receivers catch that (and any other divergence)
//! through the previous-value hash delivered with every update.
//!
//! ```
//! use serde_json::json;
//! use uplink_core::diff::{apply_patch, structural_diff};
//!
//! let prev = json!({"a": 1, "b": {"c": 2, "d": 3}});
//! let next = json!({"a": 1, "b": {"c": 5}});
//! let patch = structural_diff(&prev, &next);
//! assert_eq!(patch, json!({"b": {"c": 5, "d": null}}));
//! assert_eq!(apply_patch(&prev, &patch), next);
//! ```

use serde_json::{Map, Value};

/// Compute the patch that rewrites `prev` into `next`.
pub fn structural_diff(prev: &Value, next: &Value) -> Value {
    match (prev, next) {
        (Value::Object(prev), Value::Object(next)) => {
            let mut patch = Map::new();
            for (key, next_val) in next {
                match prev.get(key) {
                    Some(prev_val) if prev_val == next_val => {}
                    Some(prev_val) => {
                        patch.insert(key.clone(), structural_diff(prev_val, next_val));
                    }
                    None => {
                        patch.insert(key.clone(), next_val.clone());
                    }
                }
            }
            for key in prev.keys() {
                if !next.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => next.clone(),
    }
}

/// Apply a patch produced by [`structural_diff`].
pub fn apply_patch(prev: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(changes) => {
            let mut merged = match prev {
                Value::Object(prev) => prev.clone(),
                _ => Map::new(),
            };
            for (key, change) in changes {
                if change.is_null() {
                    merged.remove(key);
                } else {
                    let base = merged.get(key).cloned().unwrap_or(Value::Null);
                    merged.insert(key.clone(), apply_patch(&base, change));
                }
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
