//! Content hashing for store values.
//!
//! Every update record carries the hash of the value it applies on top of, so
//! a receiver whose cached hash disagrees knows it missed an update and must
//! fall back to a full fetch.

use serde_json::Value;

/// Hash a JSON value, hex-encoded.
///
/// Hashing goes through the compact `serde_json` string form. Object keys
/// serialize in sorted order, so two structurally equal values always hash
/// the same regardless of how their maps were built.
pub fn content_hash(value: &Value) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_string(value)?;
    Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}
