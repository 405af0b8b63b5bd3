//! Content hashing for change detection and echo suppression.
//!
//! A hash is taken over the remote-shaped payload of a record: keys sorted,
//! bookkeeping fields dropped, null fields dropped, person objects reduced
//! to their id and datetimes written as UTC with whole seconds. A change and
//! its echo from the other store then hash identically.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::remote::Fields;
use crate::storage::TableMapping;

/// Datetime layout of SQLite's `datetime()`; always UTC.
pub(crate) const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// Fields never included in a content hash.
pub const BOOKKEEPING_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "_sync_source"];

/// Hashes records of one table.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    excluded: BTreeSet<String>,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self {
            excluded: BOOKKEEPING_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ContentHasher {
    /// Hasher that also ignores the table's cross-reference field.
    pub fn for_table(mapping: &TableMapping) -> Self {
        let mut hasher = Self::default();
        hasher.excluded.insert(mapping.cross_reference_field.clone());
        hasher
    }

    /// SHA-256 hex of the canonical form of `fields`.
    pub fn hash(&self, fields: &Fields) -> String {
        let canonical: Map<String, Value> = fields
            .iter()
            .filter(|(k, v)| !self.excluded.contains(k.as_str()) && !v.is_null())
            .map(|(k, v)| (k.clone(), canonicalize(v)))
            .collect();
        sha256_hex(&Value::Object(sorted(canonical)).to_string())
    }

    /// Hash for the deletion of a record whose last content hashed to `last_hash`.
    pub fn tombstone(&self, last_hash: &str) -> String {
        sha256_hex(&format!("delete:{last_hash}"))
    }
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A remote person value: `{"id": "...", "name": "...", ..}`.
pub(crate) fn person_id(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    obj.get("name")?;
    obj.get("id")?.as_str()
}

fn canonicalize(value: &Value) -> Value {
    if let Some(id) = person_id(value) {
        return Value::String(id.to_string());
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(obj) => Value::Object(sorted(
            obj.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect(),
        )),
        Value::String(s) => Value::String(canonical_datetime(s).unwrap_or_else(|| s.clone())),
        other => other.clone(),
    }
}

/// RFC 3339 or SQLite datetime text as `YYYY-MM-DDTHH:MM:SSZ`.
fn canonical_datetime(s: &str) -> Option<String> {
    let utc = match DateTime::parse_from_rfc3339(s) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(s, SQLITE_DATETIME).ok()?.and_utc(),
    };
    Some(utc.to_rfc3339_opts(SecondsFormat::Secs, true))
}

// Rebuild in key order whether or not the map preserves insertion order.
fn sorted(map: Map<String, Value>) -> Map<String, Value> {
    let mut entries: Vec<(String, Value)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().collect()
}
