//! Remote change detection by snapshot diffing.
//!
//! Each pass fetches every record of a remote table, hashes it and compares
//! against the snapshot from the previous pass. The detector holds no state;
//! callers pass the previous snapshot in and persist the returned one.
//!
//! Inserts and updates are stamped with the record's remote modification
//! time when the store reports one, otherwise with the time of the pass.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::hash::ContentHasher;
use super::types::{ChangeAction, ChangeEvent, ChangeSource};
use crate::error::RemoteError;
use crate::remote::{Fields, RemoteStore};
use crate::storage::TableMapping;

/// Last seen state of one remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub content_hash: String,
    pub data: Fields,
}

/// Last seen state of one remote table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    records: BTreeMap<String, SnapshotEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, record_id: &str) -> Option<&SnapshotEntry> {
        self.records.get(record_id)
    }

    pub fn insert(&mut self, record_id: impl Into<String>, entry: SnapshotEntry) {
        self.records.insert(record_id.into(), entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotEntry)> {
        self.records.iter()
    }

    /// Put `record_id` back to its state in `previous`, so the change is
    /// detected again on the next pass.
    pub fn restore_record(&mut self, record_id: &str, previous: &Snapshot) {
        match previous.get(record_id) {
            Some(entry) => {
                self.records.insert(record_id.to_string(), entry.clone());
            }
            None => {
                self.records.remove(record_id);
            }
        }
    }
}

/// Diff the current contents of `mapping.remote_table` against `previous`.
///
/// Returns the events in fetch order (deletions last) and the new snapshot.
///
/// # Errors
/// Returns the fetch error; `previous` stays authoritative in that case.
pub fn detect_changes(
    remote: &dyn RemoteStore,
    mapping: &TableMapping,
    previous: &Snapshot,
) -> Result<(Vec<ChangeEvent>, Snapshot), RemoteError> {
    let records = remote.list(&mapping.remote_table, &[])?;
    let hasher = ContentHasher::for_table(mapping);
    let table = mapping.relational_table.as_str();
    let now = Utc::now();

    let mut events = Vec::new();
    let mut current = Snapshot::new();
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());

    for record in records {
        if record.record_id.is_empty() {
            tracing::debug!(table, "skipping remote record without id");
            continue;
        }
        if !seen.insert(record.record_id.clone()) {
            continue;
        }

        let content_hash = hasher.hash(&record.fields);
        let action = match previous.get(&record.record_id) {
            None => Some((ChangeAction::Insert, None)),
            Some(last) if last.content_hash != content_hash => {
                Some((ChangeAction::Update, Some(last.data.clone())))
            }
            Some(_) => None,
        };

        if let Some((action, old_data)) = action {
            events.push(ChangeEvent {
                record_id: record.record_id.clone(),
                table: table.to_string(),
                action,
                old_data,
                new_data: Some(record.fields.clone()),
                content_hash: content_hash.clone(),
                detected_at: record.modified_at().unwrap_or(now),
                source: ChangeSource::Remote,
            });
        }

        current.insert(
            record.record_id,
            SnapshotEntry {
                content_hash,
                data: record.fields,
            },
        );
    }

    for (record_id, last) in previous.iter() {
        if seen.contains(record_id) {
            continue;
        }
        events.push(ChangeEvent {
            record_id: record_id.clone(),
            table: table.to_string(),
            action: ChangeAction::Delete,
            old_data: Some(last.data.clone()),
            new_data: None,
            content_hash: hasher.tombstone(&last.content_hash),
            detected_at: now,
            source: ChangeSource::Remote,
        });
    }

    if !events.is_empty() {
        tracing::debug!(table, changes = events.len(), "detected remote changes");
    }
    Ok((events, current))
}
