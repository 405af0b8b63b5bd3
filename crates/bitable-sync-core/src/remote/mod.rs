//! Remote tabular store (Bitable) binding.
//!
//! The engine only needs per-record CRUD plus a filtered listing. Adapters
//! are synchronous so the sync loops can run on plain OS threads.

pub mod http;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

/// Record fields keyed by field name.
pub type Fields = Map<String, Value>;

/// One remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_id: String,
    #[serde(default)]
    pub fields: Fields,
    /// Last edit, in milliseconds since the epoch, when the store reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<i64>,
}

impl RemoteRecord {
    pub fn new(record_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            record_id: record_id.into(),
            fields,
            last_modified_time: None,
        }
    }

    pub fn with_modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified_time = Some(at.timestamp_millis());
        self
    }

    /// When the record was last edited, if known.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.last_modified_time.and_then(DateTime::from_timestamp_millis)
    }
}

/// Comparison operators understood by the remote filter API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    IsEmpty,
    IsNotEmpty,
    IsGreater,
    IsLess,
}

impl FilterOperator {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Is => "is",
            FilterOperator::IsNot => "isNot",
            FilterOperator::Contains => "contains",
            FilterOperator::DoesNotContain => "doesNotContain",
            FilterOperator::IsEmpty => "isEmpty",
            FilterOperator::IsNotEmpty => "isNotEmpty",
            FilterOperator::IsGreater => "isGreater",
            FilterOperator::IsLess => "isLess",
        }
    }

    /// Whether the operator takes a comparison value.
    pub fn takes_value(&self) -> bool {
        !matches!(self, FilterOperator::IsEmpty | FilterOperator::IsNotEmpty)
    }
}

/// One `(field, operator, value)` condition. A filter is a conjunction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Condition {
    /// `field is value`
    pub fn is(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Is,
            value: Some(value.into()),
        }
    }

    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// Per-record CRUD against the remote store.
///
/// `table` is the remote table address as configured
/// (`<app_token>:<table_id>` for Bitable).
pub trait RemoteStore: Send + Sync {
    /// List every record matching all `filter` conditions, in store order.
    fn list(&self, table: &str, filter: &[Condition]) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Create a record and return its id.
    fn create(&self, table: &str, fields: &Fields) -> Result<String, RemoteError>;

    /// Replace the given fields of an existing record.
    fn update(&self, table: &str, record_id: &str, fields: &Fields) -> Result<(), RemoteError>;

    /// Delete a record.
    fn delete(&self, table: &str, record_id: &str) -> Result<(), RemoteError>;

    /// Check that the store is reachable with the configured credentials.
    fn ping(&self) -> Result<(), RemoteError>;
}

/// Render a scalar value the way the remote filter compares it.
pub(crate) fn filter_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_wire_names() {
        assert_eq!(FilterOperator::IsNot.as_str(), "isNot");
        assert_eq!(FilterOperator::DoesNotContain.as_str(), "doesNotContain");
        assert_eq!(
            serde_json::to_value(FilterOperator::IsNotEmpty).unwrap(),
            json!("isNotEmpty")
        );
        assert!(!FilterOperator::IsEmpty.takes_value());
        assert!(FilterOperator::IsGreater.takes_value());
    }

    #[test]
    fn test_filter_text() {
        assert_eq!(filter_text(&json!("a")), "a");
        assert_eq!(filter_text(&json!(42)), "42");
        assert_eq!(filter_text(&Value::Null), "");
    }
}
