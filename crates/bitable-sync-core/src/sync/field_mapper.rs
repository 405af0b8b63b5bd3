//! Field name and value translation between the two stores.
//!
//! Remote records carry rich values (person objects, multi-select lists,
//! ISO-8601 datetimes); relational rows carry scalars. Translation rules:
//!
//! | remote                     | relational                          |
//! |----------------------------|-------------------------------------|
//! | `{"id": .., "name": ..}`   | the person id                       |
//! | list in a multi-value column | delimited string, or JSON text    |
//! | any other object or list   | JSON text                           |
//! | `2024-01-02T03:04:05Z`     | `2024-01-02 03:04:05` (UTC)         |
//!
//! Names are renamed per table; unmapped names pass through unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

use super::hash::{person_id, BOOKKEEPING_FIELDS, SQLITE_DATETIME};
use crate::error::SyncError;
use crate::remote::{Fields, RemoteRecord};
use crate::storage::{MultiValueEncoding, Row, TableMapping};

/// Relational columns that never travel to the remote store.
const RELATIONAL_ONLY: [&str; 2] = ["_sync_source", "_sync_hash"];

#[derive(Debug, Clone)]
struct TableRules {
    table: String,
    to_relational: BTreeMap<String, String>,
    to_remote: BTreeMap<String, String>,
    key_column: String,
    remote_id_column: String,
    cross_reference_field: String,
    multi_value_columns: HashSet<String>,
    encoding: MultiValueEncoding,
    delimiter: String,
}

impl TableRules {
    fn new(mapping: &TableMapping) -> Self {
        Self {
            table: mapping.relational_table.clone(),
            to_relational: mapping.fields.clone(),
            to_remote: mapping
                .fields
                .iter()
                .map(|(remote, relational)| (relational.clone(), remote.clone()))
                .collect(),
            key_column: mapping.key_column.clone(),
            remote_id_column: mapping.remote_id_column.clone(),
            cross_reference_field: mapping.cross_reference_field.clone(),
            multi_value_columns: mapping.multi_value_columns.iter().cloned().collect(),
            encoding: mapping.multi_value_encoding,
            delimiter: mapping.multi_value_delimiter.clone(),
        }
    }

    fn translation_error(&self, field: &str, message: impl Into<String>) -> SyncError {
        SyncError::Translation {
            table: self.table.clone(),
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn skip_remote_field(&self, name: &str) -> bool {
        BOOKKEEPING_FIELDS.contains(&name) || name == self.cross_reference_field
    }

    fn skip_relational_column(&self, name: &str) -> bool {
        BOOKKEEPING_FIELDS.contains(&name)
            || RELATIONAL_ONLY.contains(&name)
            || name == self.key_column
            || name == self.remote_id_column
    }

    fn encode_list(&self, column: &str, items: Vec<String>) -> Result<Value, SyncError> {
        match self.encoding {
            MultiValueEncoding::Json => Ok(Value::String(Value::from(items).to_string())),
            MultiValueEncoding::Delimited => {
                if let Some(bad) = items.iter().find(|s| s.contains(self.delimiter.as_str())) {
                    return Err(self.translation_error(
                        column,
                        format!(
                            "list element '{bad}' contains the delimiter '{}'; use multi_value_encoding = \"json\"",
                            self.delimiter
                        ),
                    ));
                }
                Ok(Value::String(items.join(&self.delimiter)))
            }
        }
    }

    fn decode_list(&self, column: &str, text: &str) -> Result<Value, SyncError> {
        match self.encoding {
            MultiValueEncoding::Delimited => {
                if text.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }
                Ok(Value::Array(
                    text.split(self.delimiter.as_str())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                ))
            }
            MultiValueEncoding::Json => match serde_json::from_str::<Value>(text) {
                Ok(list @ Value::Array(_)) => Ok(list),
                Ok(_) | Err(_) if text.is_empty() => Ok(Value::Array(Vec::new())),
                Ok(other) => Err(self.translation_error(
                    column,
                    format!("expected a JSON list, found {other}"),
                )),
                Err(e) => Err(self.translation_error(column, format!("invalid JSON list: {e}"))),
            },
        }
    }

    fn value_to_relational(&self, column: &str, value: &Value) -> Result<Value, SyncError> {
        if let Some(id) = person_id(value) {
            return Ok(Value::String(id.to_string()));
        }
        match value {
            Value::Array(items) => {
                let reduced: Vec<Value> = items
                    .iter()
                    .map(|v| person_id(v).map_or_else(|| v.clone(), |id| Value::String(id.to_string())))
                    .collect();
                if !self.multi_value_columns.contains(column) {
                    return Ok(Value::String(Value::Array(reduced).to_string()));
                }
                let strings: Option<Vec<String>> = reduced
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                match (strings, self.encoding) {
                    (Some(strings), _) => self.encode_list(column, strings),
                    (None, MultiValueEncoding::Json) => Ok(Value::String(Value::Array(reduced).to_string())),
                    (None, MultiValueEncoding::Delimited) => Err(self.translation_error(
                        column,
                        "delimited list columns hold text elements only; use multi_value_encoding = \"json\"",
                    )),
                }
            }
            Value::Object(_) => Ok(Value::String(value.to_string())),
            Value::String(s) => Ok(Value::String(iso_to_sqlite(s).unwrap_or_else(|| s.clone()))),
            other => Ok(other.clone()),
        }
    }

    fn value_to_remote(&self, column: &str, value: &Value) -> Result<Value, SyncError> {
        let Value::String(s) = value else {
            return Ok(value.clone());
        };
        if self.multi_value_columns.contains(column) {
            return self.decode_list(column, s);
        }
        if s.starts_with('{') || s.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                return Ok(parsed);
            }
        }
        Ok(Value::String(sqlite_to_iso(s).unwrap_or_else(|| s.clone())))
    }
}

/// Translates records of every configured table.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    tables: HashMap<String, TableRules>,
}

impl FieldMapper {
    /// Build from table mappings, keyed by relational table name.
    pub fn new(mappings: &[TableMapping]) -> Self {
        Self {
            tables: mappings
                .iter()
                .map(|m| (m.relational_table.clone(), TableRules::new(m)))
                .collect(),
        }
    }

    fn rules(&self, table: &str) -> Result<&TableRules, SyncError> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::MissingTableMapping(table.to_string()))
    }

    /// Translate a remote record into a relational row. The row carries the
    /// remote record id in the table's remote id column; callers drop it for
    /// tables without that column.
    ///
    /// # Errors
    /// Fails if the table is not mapped or a value cannot be represented.
    pub fn to_relational(&self, table: &str, record: &RemoteRecord) -> Result<Row, SyncError> {
        let rules = self.rules(table)?;
        let mut row = Row::new();
        for (name, value) in &record.fields {
            if rules.skip_remote_field(name) {
                continue;
            }
            let column = rules.to_relational.get(name).unwrap_or(name);
            if column == &rules.remote_id_column {
                continue;
            }
            row.insert(column.clone(), rules.value_to_relational(column, value)?);
        }
        row.insert(
            rules.remote_id_column.clone(),
            Value::String(record.record_id.clone()),
        );
        Ok(row)
    }

    /// Translate a relational row into remote fields. Bookkeeping columns,
    /// the key column and the remote id column are dropped.
    ///
    /// # Errors
    /// Fails if the table is not mapped or a list column cannot be decoded.
    pub fn to_remote(&self, table: &str, row: &Row) -> Result<Fields, SyncError> {
        let rules = self.rules(table)?;
        let mut fields = Fields::new();
        for (column, value) in row {
            if rules.skip_relational_column(column) {
                continue;
            }
            let name = rules.to_remote.get(column).unwrap_or(column);
            fields.insert(name.clone(), rules.value_to_remote(column, value)?);
        }
        Ok(fields)
    }
}

/// `2024-01-02T11:04:05+08:00` -> `2024-01-02 03:04:05`
fn iso_to_sqlite(s: &str) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(s).ok()?;
    Some(parsed.with_timezone(&Utc).format(SQLITE_DATETIME).to_string())
}

/// `2024-01-02 03:04:05` -> `2024-01-02T03:04:05Z`
fn sqlite_to_iso(s: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(s, SQLITE_DATETIME).ok()?;
    Some(parsed.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
}
