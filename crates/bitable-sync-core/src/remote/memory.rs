//! In-process remote store.
//!
//! Keeps records in insertion order per table and can be told to fail, so
//! tests and dry runs can drive the engine without the network. Every write
//! stamps the record's modification time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;

use super::{filter_text, Condition, Fields, FilterOperator, RemoteRecord, RemoteStore};
use crate::error::RemoteError;

/// Remote store backed by a map of tables.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    tables: Mutex<HashMap<String, Vec<RemoteRecord>>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Vec<RemoteRecord>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), RemoteError> {
        self.check_available()?;
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Unavailable("injected write failure".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Make every call fail with [`RemoteError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` create/update/delete calls.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of successful create/update/delete calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a record with a chosen id, bypassing failure injection.
    /// Replaces an existing record with the same id in place.
    pub fn put(&self, table: &str, record_id: &str, fields: Fields) {
        let mut tables = self.tables();
        let records = tables.entry(table.to_string()).or_default();
        let record = RemoteRecord::new(record_id, fields).with_modified_at(Utc::now());
        match records.iter_mut().find(|r| r.record_id == record_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Remove a record directly, bypassing failure injection.
    pub fn remove(&self, table: &str, record_id: &str) -> bool {
        let mut tables = self.tables();
        let Some(records) = tables.get_mut(table) else {
            return false;
        };
        let before = records.len();
        records.retain(|r| r.record_id != record_id);
        records.len() != before
    }

    /// Snapshot of one record.
    pub fn get(&self, table: &str, record_id: &str) -> Option<RemoteRecord> {
        self.tables()
            .get(table)
            .and_then(|records| records.iter().find(|r| r.record_id == record_id).cloned())
    }

    /// Every record of a table, in insertion order.
    pub fn records(&self, table: &str) -> Vec<RemoteRecord> {
        self.tables().get(table).cloned().unwrap_or_default()
    }
}

fn matches(record: &RemoteRecord, condition: &Condition) -> bool {
    let field = record.fields.get(&condition.field);
    let is_empty = match field {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    };
    let actual = field.map(filter_text).unwrap_or_default();
    let expected = condition.value.as_ref().map(filter_text).unwrap_or_default();

    match condition.operator {
        FilterOperator::IsEmpty => is_empty,
        FilterOperator::IsNotEmpty => !is_empty,
        FilterOperator::Is => actual == expected,
        FilterOperator::IsNot => actual != expected,
        FilterOperator::Contains => actual.contains(&expected),
        FilterOperator::DoesNotContain => !actual.contains(&expected),
        FilterOperator::IsGreater | FilterOperator::IsLess => {
            let ordering = match (actual.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(actual.cmp(&expected)),
            };
            match condition.operator {
                FilterOperator::IsGreater => ordering == Some(std::cmp::Ordering::Greater),
                _ => ordering == Some(std::cmp::Ordering::Less),
            }
        }
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn list(&self, table: &str, filter: &[Condition]) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.check_available()?;
        Ok(self
            .tables()
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.iter().all(|c| matches(r, c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create(&self, table: &str, fields: &Fields) -> Result<String, RemoteError> {
        self.check_write()?;
        let id = format!("rec{:08}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.tables()
            .entry(table.to_string())
            .or_default()
            .push(RemoteRecord::new(id.clone(), fields.clone()).with_modified_at(Utc::now()));
        Ok(id)
    }

    fn update(&self, table: &str, record_id: &str, fields: &Fields) -> Result<(), RemoteError> {
        self.check_write()?;
        let mut tables = self.tables();
        let record = tables
            .get_mut(table)
            .and_then(|records| records.iter_mut().find(|r| r.record_id == record_id))
            .ok_or_else(|| RemoteError::NotFound {
                table: table.to_string(),
                record_id: record_id.to_string(),
            })?;
        for (k, v) in fields {
            record.fields.insert(k.clone(), v.clone());
        }
        record.last_modified_time = Some(Utc::now().timestamp_millis());
        Ok(())
    }

    fn delete(&self, table: &str, record_id: &str) -> Result<(), RemoteError> {
        self.check_write()?;
        if self.remove(table, record_id) {
            Ok(())
        } else {
            Err(RemoteError::NotFound {
                table: table.to_string(),
                record_id: record_id.to_string(),
            })
        }
    }

    fn ping(&self) -> Result<(), RemoteError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_preserves_order_and_generates_ids() {
        let store = MemoryRemoteStore::new();
        let a = store.create("t", &fields(json!({"n": 1}))).unwrap();
        let b = store.create("t", &fields(json!({"n": 2}))).unwrap();
        assert_eq!(a, "rec00000001");
        assert_eq!(b, "rec00000002");

        let ids: Vec<_> = store
            .list("t", &[])
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_update_merges_fields_and_reports_missing() {
        let store = MemoryRemoteStore::new();
        store.put("t", "r1", fields(json!({"a": 1, "b": 2})));
        let seeded = store.get("t", "r1").unwrap().modified_at().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.update("t", "r1", &fields(json!({"b": 3}))).unwrap();
        let record = store.get("t", "r1").unwrap();
        assert_eq!(record.fields, fields(json!({"a": 1, "b": 3})));
        assert!(record.modified_at().unwrap() > seeded);

        let err = store.update("t", "nope", &Fields::new()).unwrap_err();
        assert!(matches!(err, RemoteError::NotFound { .. }));
    }

    #[test]
    fn test_filter_conditions() {
        let store = MemoryRemoteStore::new();
        store.put("t", "r1", fields(json!({"db_id": "7", "age": 30})));
        store.put("t", "r2", fields(json!({"db_id": "8", "age": 20})));
        store.put("t", "r3", fields(json!({"age": 10})));

        let hit = store.list("t", &[Condition::is("db_id", "8")]).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].record_id, "r2");

        let empty = store
            .list("t", &[Condition::new("db_id", FilterOperator::IsEmpty, None)])
            .unwrap();
        assert_eq!(empty[0].record_id, "r3");

        let older = store
            .list("t", &[Condition::new("age", FilterOperator::IsGreater, Some(json!(15)))])
            .unwrap();
        assert_eq!(older.len(), 2);
    }

    #[test]
    fn test_failure_injection() {
        let store = MemoryRemoteStore::new();
        store.fail_next_writes(1);
        assert!(store.create("t", &Fields::new()).is_err());
        assert!(store.create("t", &Fields::new()).is_ok());
        assert_eq!(store.write_count(), 1);

        store.set_unavailable(true);
        assert!(store.ping().is_err());
        assert!(store.list("t", &[]).unwrap_err().is_retryable());
        store.set_unavailable(false);
        assert!(store.ping().is_ok());
    }
}
