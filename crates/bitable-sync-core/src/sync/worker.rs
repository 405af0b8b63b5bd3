//! Applies one change in one direction.
//!
//! Each change goes through the same steps: echo check, translation,
//! identity resolution (insert on miss), apply, sync log entry, and
//! bookkeeping on the source side. Application is idempotent: replaying an
//! insert whose identity is already mapped becomes an update, and an update
//! whose target vanished re-creates it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use serde_json::Value;

use super::conflict_resolver::ConflictStrategy;
use super::field_mapper::FieldMapper;
use super::hash::ContentHasher;
use super::identity_map::IdentityMap;
use super::outbound_queue::OutboundQueue;
use super::sync_log::SyncLog;
use super::types::{
    ChangeAction, ChangeEvent, ChangeSource, Direction, LogStatus, OutboundQueueItem,
};
use crate::error::{DatabaseError, RemoteError, SyncError};
use crate::remote::{Condition, Fields, RemoteRecord, RemoteStore};
use crate::storage::database::quote_ident;
use crate::storage::{Database, SyncConfig, TableMapping};

/// Result of applying one change.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied,
    /// Nothing to do; the reason is logged.
    Skipped(String),
    Failed(SyncError),
}

impl ApplyOutcome {
    fn log_status(&self) -> (LogStatus, Option<String>) {
        match self {
            ApplyOutcome::Applied => (LogStatus::Completed, None),
            ApplyOutcome::Skipped(reason) => (LogStatus::Skipped, Some(reason.clone())),
            ApplyOutcome::Failed(e) => (LogStatus::Failed, Some(e.to_string())),
        }
    }
}

/// A queue item with its hash and translated payload.
struct PreparedItem {
    event: ChangeEvent,
    fields: Option<Fields>,
}

/// Replicates single changes between the two stores.
pub struct SyncWorker {
    db: Database,
    remote: Arc<dyn RemoteStore>,
    queue: OutboundQueue,
    log: SyncLog,
    identity: IdentityMap,
    mapper: FieldMapper,
    tables: HashMap<String, TableMapping>,
    strategy: ConflictStrategy,
    loop_window: Duration,
    /// Per relational table: does the remote id column exist?
    remote_id_columns: Mutex<HashMap<String, bool>>,
}

impl SyncWorker {
    pub fn new(db: Database, remote: Arc<dyn RemoteStore>, config: &SyncConfig) -> Self {
        Self {
            queue: OutboundQueue::new(db.clone(), config.max_retries),
            log: SyncLog::new(db.clone()),
            identity: IdentityMap::new(db.clone()),
            mapper: FieldMapper::new(&config.tables),
            tables: config
                .tables
                .iter()
                .map(|t| (t.relational_table.clone(), t.clone()))
                .collect(),
            strategy: config.conflict_strategy,
            loop_window: config.loop_window(),
            remote_id_columns: Mutex::new(HashMap::new()),
            db,
            remote,
        }
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    fn mapping(&self, table: &str) -> Result<&TableMapping, SyncError> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::MissingTableMapping(table.to_string()))
    }

    /// Whether the table has its remote id column. Looked up once per table;
    /// a table that does not exist yet is checked again next time.
    fn has_remote_id_column(&self, mapping: &TableMapping) -> Result<bool, SyncError> {
        let table = mapping.relational_table.as_str();
        let mut known = self
            .remote_id_columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(&present) = known.get(table) {
            return Ok(present);
        }
        let columns = self.db.table_columns(table)?;
        let present = columns.iter().any(|c| c == &mapping.remote_id_column);
        if !columns.is_empty() {
            if !present {
                tracing::info!(
                    table,
                    column = %mapping.remote_id_column,
                    "remote id column not present; relying on the identity map"
                );
            }
            known.insert(table.to_string(), present);
        }
        Ok(present)
    }

    /// Write one replication outcome to the sync log.
    ///
    /// # Errors
    /// Returns an error if the log cannot be written.
    pub fn record_replication(
        &self,
        event: &ChangeEvent,
        direction: Direction,
        status: LogStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.log.record(
            &event.table,
            &event.record_id,
            direction,
            &event.content_hash,
            status,
            error,
        )
    }

    fn finish(&self, event: &ChangeEvent, direction: Direction, outcome: &ApplyOutcome) {
        let (status, message) = outcome.log_status();
        if let Err(e) = self.record_replication(event, direction, status, message.as_deref()) {
            tracing::warn!(table = %event.table, record_id = %event.record_id, error = %e, "failed to write sync log");
        }
        match outcome {
            ApplyOutcome::Applied => tracing::debug!(
                table = %event.table,
                record_id = %event.record_id,
                direction = %direction,
                action = %event.action,
                "replicated change"
            ),
            ApplyOutcome::Skipped(reason) => tracing::debug!(
                table = %event.table,
                record_id = %event.record_id,
                direction = %direction,
                reason = %reason,
                "skipped change"
            ),
            ApplyOutcome::Failed(e) => tracing::warn!(
                table = %event.table,
                record_id = %event.record_id,
                direction = %direction,
                retryable = e.is_retryable(),
                error = %e,
                "failed to replicate change"
            ),
        }
    }

    // ── remote -> relational ─────────────────────────────────────────

    /// Apply a remote-origin change to the relational store.
    ///
    /// Failures are logged but not persisted anywhere else; the caller
    /// decides whether the change is detected again.
    pub fn apply_remote(&self, event: &ChangeEvent) -> ApplyOutcome {
        let outcome = self
            .try_apply_remote(event)
            .unwrap_or_else(ApplyOutcome::Failed);
        self.finish(event, Direction::RemoteToRelational, &outcome);
        outcome
    }

    fn try_apply_remote(&self, event: &ChangeEvent) -> Result<ApplyOutcome, SyncError> {
        let mapping = self.mapping(&event.table)?;
        if self.log.check_recent_opposite_direction(
            &event.content_hash,
            Direction::RemoteToRelational,
            self.loop_window,
        )? {
            return Ok(ApplyOutcome::Skipped("echo of a relational change".into()));
        }

        let data = event.new_data.as_ref().or(event.old_data.as_ref());
        let relational_id = self.find_relational_id(mapping, &event.record_id, data)?;

        // A mapped row with pending items is a conflict. If the remote side
        // wins, every pending item for the row is superseded.
        let mut superseded = Vec::new();
        if let Some(rid) = &relational_id {
            let pending = self.queue.pending_for_record(&event.table, rid)?;
            if let Some((item_id, local)) = self.newest_local_change(mapping, &pending)? {
                if self.strategy.resolve(event, &local).source == ChangeSource::Relational {
                    return Ok(ApplyOutcome::Skipped(format!(
                        "pending relational change {item_id} wins the conflict"
                    )));
                }
            }
            superseded = pending;
        }

        let outcome = match event.action {
            ChangeAction::Insert | ChangeAction::Update => {
                self.upsert_relational(mapping, event, relational_id)?
            }
            ChangeAction::Delete => self.delete_relational(mapping, event, relational_id)?,
        };

        for pending in &superseded {
            self.queue.mark_completed(pending.id)?;
            let local = match self.prepare_item(mapping, pending) {
                Ok(prepared) => prepared.event,
                Err(_) => self.unprepared_event(pending),
            };
            self.record_replication(
                &local,
                Direction::RelationalToRemote,
                LogStatus::Skipped,
                Some("superseded by a remote change"),
            )?;
        }
        if !superseded.is_empty() {
            tracing::debug!(
                table = %event.table,
                record_id = %event.record_id,
                count = superseded.len(),
                "superseded pending relational changes"
            );
        }
        Ok(outcome)
    }

    /// The newest pending item that is a local edit rather than the echo of
    /// a remote change this worker wrote. Items that cannot be translated
    /// are ignored; they fail on their own when replicated.
    fn newest_local_change(
        &self,
        mapping: &TableMapping,
        pending: &[OutboundQueueItem],
    ) -> Result<Option<(i64, ChangeEvent)>, SyncError> {
        for item in pending {
            let Ok(prepared) = self.prepare_item(mapping, item) else {
                continue;
            };
            let echo = self.log.check_recent_opposite_direction(
                &prepared.event.content_hash,
                Direction::RelationalToRemote,
                self.loop_window,
            )?;
            if !echo {
                return Ok(Some((item.id, prepared.event)));
            }
        }
        Ok(None)
    }

    /// Mapped row id, falling back to the remote id column and then to the
    /// remote record's cross-reference field. Fallback hits are re-mapped.
    fn find_relational_id(
        &self,
        mapping: &TableMapping,
        remote_id: &str,
        data: Option<&Fields>,
    ) -> Result<Option<String>, SyncError> {
        let table = mapping.relational_table.as_str();
        if let Some(id) = self.identity.get_relational_id(table, remote_id)? {
            return Ok(Some(id));
        }

        let mut found = None;
        if self.has_remote_id_column(mapping)? {
            let by_remote_id = format!(
                "SELECT {key} AS k FROM {tbl} WHERE {col} = ?1 LIMIT 1",
                key = quote_ident(&mapping.key_column),
                tbl = quote_ident(table),
                col = quote_ident(&mapping.remote_id_column),
            );
            found = self
                .db
                .query_one(&by_remote_id, &[Value::String(remote_id.to_string())])?
                .and_then(|row| row.get("k").and_then(value_text));
        }

        if found.is_none() {
            if let Some(xref) = data
                .and_then(|d| d.get(&mapping.cross_reference_field))
                .and_then(value_text)
            {
                let by_key = format!(
                    "SELECT {key} AS k FROM {tbl} WHERE {key} = ?1 LIMIT 1",
                    key = quote_ident(&mapping.key_column),
                    tbl = quote_ident(table),
                );
                found = self
                    .db
                    .query_one(&by_key, &[Value::String(xref)])?
                    .and_then(|row| row.get("k").and_then(value_text));
            }
        }

        if let Some(id) = &found {
            self.identity.save(table, id, remote_id)?;
        }
        Ok(found)
    }

    fn upsert_relational(
        &self,
        mapping: &TableMapping,
        event: &ChangeEvent,
        relational_id: Option<String>,
    ) -> Result<ApplyOutcome, SyncError> {
        let table = mapping.relational_table.as_str();
        let data = event.new_data.as_ref().ok_or_else(|| SyncError::MissingPayload {
            table: table.to_string(),
            record_id: event.record_id.clone(),
            payload: "new",
        })?;
        let record = RemoteRecord::new(event.record_id.clone(), data.clone());
        let mut row = self.mapper.to_relational(table, &record)?;
        if !self.has_remote_id_column(mapping)? {
            row.remove(&mapping.remote_id_column);
        }

        if let Some(rid) = relational_id {
            let key = Value::String(rid.clone());
            if self.db.update(table, &mapping.key_column, &key, &row)? > 0 {
                return Ok(ApplyOutcome::Applied);
            }
            tracing::info!(table, relational_id = %rid, remote_id = %event.record_id, "mapped row is gone, re-creating");
        }

        let rowid = self.db.insert(table, &row)?;
        let select_key = format!(
            "SELECT {key} AS k FROM {tbl} WHERE rowid = ?1",
            key = quote_ident(&mapping.key_column),
            tbl = quote_ident(table),
        );
        let rid = self
            .db
            .query_one(&select_key, &[Value::from(rowid)])?
            .and_then(|row| row.get("k").and_then(value_text))
            .unwrap_or_else(|| rowid.to_string());
        self.identity.save(table, &rid, &event.record_id)?;
        Ok(ApplyOutcome::Applied)
    }

    fn delete_relational(
        &self,
        mapping: &TableMapping,
        event: &ChangeEvent,
        relational_id: Option<String>,
    ) -> Result<ApplyOutcome, SyncError> {
        let table = mapping.relational_table.as_str();
        let Some(rid) = relational_id else {
            return Ok(ApplyOutcome::Skipped("no relational row for this record".into()));
        };
        self.db
            .delete(table, &mapping.key_column, &Value::String(rid))?;
        self.identity.remove_by_remote_id(table, &event.record_id)?;
        Ok(ApplyOutcome::Applied)
    }

    // ── relational -> remote ─────────────────────────────────────────

    /// Apply a queued relational change to the remote store and settle the
    /// queue item.
    pub fn apply_relational(&self, item: &OutboundQueueItem) -> ApplyOutcome {
        if let Err(e) = self.queue.mark_processing(item.id) {
            return ApplyOutcome::Failed(e.into());
        }

        let (event, outcome) = match self
            .mapping(&item.table_name)
            .and_then(|mapping| Ok((mapping, self.prepare_item(mapping, item)?)))
        {
            Ok((mapping, prepared)) => {
                let outcome = self
                    .try_apply_relational(mapping, &prepared)
                    .unwrap_or_else(ApplyOutcome::Failed);
                (prepared.event, outcome)
            }
            Err(e) => (self.unprepared_event(item), ApplyOutcome::Failed(e)),
        };
        self.finish(&event, Direction::RelationalToRemote, &outcome);

        let settled = match &outcome {
            ApplyOutcome::Applied | ApplyOutcome::Skipped(_) => self.queue.mark_completed(item.id),
            ApplyOutcome::Failed(e) if e.is_retryable() => self
                .queue
                .mark_failed(item.id, &e.to_string())
                .map(|status| {
                    tracing::debug!(item = item.id, status = %status, "queue item rescheduled");
                }),
            ApplyOutcome::Failed(e) => self.queue.abandon(item.id, &e.to_string()),
        };
        if let Err(e) = settled {
            tracing::warn!(item = item.id, error = %e, "failed to update queue item");
        }
        outcome
    }

    /// Event for an item whose payload could not be prepared.
    fn unprepared_event(&self, item: &OutboundQueueItem) -> ChangeEvent {
        ChangeEvent {
            record_id: item.record_id.clone(),
            table: item.table_name.clone(),
            action: item.action,
            old_data: item.old_data.clone(),
            new_data: item.new_data.clone(),
            content_hash: item
                .content_hash
                .clone()
                .unwrap_or_else(|| format!("queue-{}", item.id)),
            detected_at: item.created_at,
            source: ChangeSource::Relational,
        }
    }

    /// Translate a queue item and compute its remote-shaped hash.
    fn prepare_item(
        &self,
        mapping: &TableMapping,
        item: &OutboundQueueItem,
    ) -> Result<PreparedItem, SyncError> {
        let table = mapping.relational_table.as_str();
        let hasher = ContentHasher::for_table(mapping);
        let missing = |payload: &'static str| SyncError::MissingPayload {
            table: table.to_string(),
            record_id: item.record_id.clone(),
            payload,
        };

        let (fields, content_hash) = match item.action {
            ChangeAction::Insert | ChangeAction::Update => {
                let row = item.new_data.as_ref().ok_or_else(|| missing("new"))?;
                let fields = self.mapper.to_remote(table, row)?;
                let hash = item
                    .content_hash
                    .clone()
                    .unwrap_or_else(|| hasher.hash(&fields));
                (Some(fields), hash)
            }
            ChangeAction::Delete => {
                let hash = match &item.content_hash {
                    Some(hash) => hash.clone(),
                    None => {
                        let row = item.old_data.as_ref().ok_or_else(|| missing("old"))?;
                        hasher.tombstone(&hasher.hash(&self.mapper.to_remote(table, row)?))
                    }
                };
                (None, hash)
            }
        };

        Ok(PreparedItem {
            event: ChangeEvent {
                record_id: item.record_id.clone(),
                table: table.to_string(),
                action: item.action,
                old_data: item.old_data.clone(),
                new_data: item.new_data.clone(),
                content_hash,
                detected_at: item.created_at,
                source: ChangeSource::Relational,
            },
            fields,
        })
    }

    fn try_apply_relational(
        &self,
        mapping: &TableMapping,
        prepared: &PreparedItem,
    ) -> Result<ApplyOutcome, SyncError> {
        let event = &prepared.event;
        if self.log.check_recent_opposite_direction(
            &event.content_hash,
            Direction::RelationalToRemote,
            self.loop_window,
        )? {
            return Ok(ApplyOutcome::Skipped("echo of a remote change".into()));
        }

        let remote_id = self.find_remote_id(mapping, &event.record_id)?;
        match (&prepared.fields, event.action) {
            (Some(fields), ChangeAction::Insert | ChangeAction::Update) => {
                let mut fields = fields.clone();
                fields.insert(
                    mapping.cross_reference_field.clone(),
                    Value::String(event.record_id.clone()),
                );
                self.upsert_remote(mapping, &event.record_id, remote_id, &fields)
            }
            (_, ChangeAction::Delete) => self.delete_remote(mapping, &event.record_id, remote_id),
            (None, _) => Err(SyncError::MissingPayload {
                table: event.table.clone(),
                record_id: event.record_id.clone(),
                payload: "new",
            }),
        }
    }

    /// Mapped remote id, falling back to a search on the cross-reference field.
    fn find_remote_id(&self, mapping: &TableMapping, relational_id: &str) -> Result<Option<String>, SyncError> {
        let table = mapping.relational_table.as_str();
        if let Some(id) = self.identity.get_remote_id(table, relational_id)? {
            return Ok(Some(id));
        }
        let hits = self.remote.list(
            &mapping.remote_table,
            &[Condition::is(mapping.cross_reference_field.clone(), relational_id)],
        )?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        self.identity.save(table, relational_id, &hit.record_id)?;
        Ok(Some(hit.record_id))
    }

    fn upsert_remote(
        &self,
        mapping: &TableMapping,
        relational_id: &str,
        remote_id: Option<String>,
        fields: &Fields,
    ) -> Result<ApplyOutcome, SyncError> {
        let table = mapping.relational_table.as_str();
        if let Some(rid) = remote_id {
            match self.remote.update(&mapping.remote_table, &rid, fields) {
                Ok(()) => return Ok(ApplyOutcome::Applied),
                Err(RemoteError::NotFound { .. }) => {
                    tracing::info!(table, relational_id, remote_id = %rid, "mapped remote record is gone, re-creating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let created = self.remote.create(&mapping.remote_table, fields)?;
        self.identity.save(table, relational_id, &created)?;
        Ok(ApplyOutcome::Applied)
    }

    fn delete_remote(
        &self,
        mapping: &TableMapping,
        relational_id: &str,
        remote_id: Option<String>,
    ) -> Result<ApplyOutcome, SyncError> {
        let table = mapping.relational_table.as_str();
        let Some(rid) = remote_id else {
            return Ok(ApplyOutcome::Skipped("no remote record for this row".into()));
        };
        match self.remote.delete(&mapping.remote_table, &rid) {
            Ok(()) | Err(RemoteError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.identity.remove_by_relational_id(table, relational_id)?;
        Ok(ApplyOutcome::Applied)
    }
}

/// Id-like value as text.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
