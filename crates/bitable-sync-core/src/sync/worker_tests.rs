//! Tests for worker module.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::{json, Value};

    use super::super::worker::*;
    use crate::remote::{Fields, MemoryRemoteStore, RemoteStore};
    use crate::storage::{Database, SyncConfig, TableMapping};
    use crate::sync::capture::install_capture_triggers;
    use crate::sync::conflict_resolver::ConflictStrategy;
    use crate::sync::hash::ContentHasher;
    use crate::sync::types::{ChangeAction, ChangeEvent, ChangeSource, LogStatus, QueueStatus};

    const REMOTE_TABLE: &str = "app:tbl";

    fn obj(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn mapping() -> TableMapping {
        TableMapping::new(REMOTE_TABLE, "users").with_field("姓名", "name")
    }

    struct Harness {
        db: Database,
        remote: Arc<MemoryRemoteStore>,
        worker: SyncWorker,
    }

    fn harness_with(strategy: ConflictStrategy) -> Harness {
        let db = Database::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, feishu_id TEXT)",
            &[],
        )
        .unwrap();
        install_capture_triggers(&db, "users", "id").unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let config = SyncConfig {
            tables: vec![mapping()],
            conflict_strategy: strategy,
            ..SyncConfig::default()
        };
        let worker = SyncWorker::new(db.clone(), remote.clone(), &config);
        Harness { db, remote, worker }
    }

    fn harness() -> Harness {
        harness_with(ConflictStrategy::LastWriteWins)
    }

    fn remote_event(record_id: &str, action: ChangeAction, fields: Option<Fields>) -> ChangeEvent {
        let hasher = ContentHasher::for_table(&mapping());
        let content_hash = match &fields {
            Some(f) => hasher.hash(f),
            None => hasher.tombstone("gone"),
        };
        ChangeEvent {
            record_id: record_id.into(),
            table: "users".into(),
            action,
            old_data: None,
            new_data: fields,
            content_hash,
            detected_at: Utc::now(),
            source: ChangeSource::Remote,
        }
    }

    fn user_names(db: &Database) -> Vec<Value> {
        db.query("SELECT name FROM users ORDER BY id", &[])
            .unwrap()
            .into_iter()
            .map(|row| row["name"].clone())
            .collect()
    }

    fn drain(h: &Harness) -> Vec<ApplyOutcome> {
        let items = h.worker.queue().dequeue_pending(100).unwrap();
        items.iter().map(|item| h.worker.apply_relational(item)).collect()
    }

    #[test]
    fn test_remote_insert_creates_row_and_mapping() {
        let h = harness();
        let event = remote_event("rec1", ChangeAction::Insert, Some(obj(json!({"姓名": "张三", "age": 25}))));
        assert!(matches!(h.worker.apply_remote(&event), ApplyOutcome::Applied));

        let row = h.db.query_one("SELECT * FROM users", &[]).unwrap().unwrap();
        assert_eq!(row["name"], json!("张三"));
        assert_eq!(row["age"], json!(25));
        assert_eq!(row["feishu_id"], json!("rec1"));
        assert_eq!(
            h.worker.identity().get_relational_id("users", "rec1").unwrap(),
            Some("1".to_string())
        );
        let entry = h.worker.log().get(&event.sync_id()).unwrap().unwrap();
        assert_eq!(entry.status, LogStatus::Completed);
    }

    #[test]
    fn test_remote_insert_replay_is_idempotent() {
        let h = harness();
        let event = remote_event("rec1", ChangeAction::Insert, Some(obj(json!({"姓名": "A"}))));
        h.worker.apply_remote(&event);
        h.worker.apply_remote(&event);
        assert_eq!(user_names(&h.db), vec![json!("A")]);
    }

    #[test]
    fn test_remote_update_recreates_vanished_row() {
        let h = harness();
        h.worker.identity().save("users", "9", "rec1").unwrap();
        let event = remote_event("rec1", ChangeAction::Update, Some(obj(json!({"姓名": "B"}))));
        assert!(matches!(h.worker.apply_remote(&event), ApplyOutcome::Applied));

        assert_eq!(user_names(&h.db), vec![json!("B")]);
        assert_eq!(
            h.worker.identity().get_remote_id("users", "1").unwrap(),
            Some("rec1".to_string())
        );
    }

    #[test]
    fn test_remote_insert_with_cross_reference_updates_existing_row() {
        let h = harness();
        h.db.execute("INSERT INTO users (name) VALUES ('old')", &[]).unwrap();
        let event = remote_event("rec7", ChangeAction::Insert, Some(obj(json!({"姓名": "new", "db_id": "1"}))));
        assert!(matches!(h.worker.apply_remote(&event), ApplyOutcome::Applied));
        assert_eq!(user_names(&h.db), vec![json!("new")]);
        assert_eq!(
            h.worker.identity().get_relational_id("users", "rec7").unwrap(),
            Some("1".to_string())
        );
    }

    #[test]
    fn test_remote_delete_removes_row_and_mapping() {
        let h = harness();
        let insert = remote_event("rec1", ChangeAction::Insert, Some(obj(json!({"姓名": "A"}))));
        h.worker.apply_remote(&insert);

        let delete = remote_event("rec1", ChangeAction::Delete, None);
        assert!(matches!(h.worker.apply_remote(&delete), ApplyOutcome::Applied));
        assert!(user_names(&h.db).is_empty());
        assert_eq!(h.worker.identity().count("users").unwrap(), 0);

        assert!(matches!(h.worker.apply_remote(&delete), ApplyOutcome::Skipped(_)));
    }

    #[test]
    fn test_untranslatable_remote_change_fails_without_retry() {
        let h = harness();
        let mut config = SyncConfig::default();
        config.tables = vec![mapping().with_multi_value_column("tags")];
        let worker = SyncWorker::new(h.db.clone(), h.remote.clone(), &config);
        let event = remote_event("rec1", ChangeAction::Insert, Some(obj(json!({"tags": ["a,b"]}))));
        match worker.apply_remote(&event) {
            ApplyOutcome::Failed(e) => assert!(!e.is_retryable()),
            other => panic!("expected failure, got {other:?}"),
        }
        let entry = worker.log().get(&event.sync_id()).unwrap().unwrap();
        assert_eq!(entry.status, LogStatus::Failed);
    }

    #[test]
    fn test_relational_insert_creates_remote_record_with_cross_reference() {
        let h = harness();
        h.db.execute("INSERT INTO users (name, age) VALUES ('Alice', 30)", &[]).unwrap();
        let outcomes = drain(&h);
        assert!(matches!(outcomes[..], [ApplyOutcome::Applied]));

        let records = h.remote.records(REMOTE_TABLE);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields, obj(json!({"姓名": "Alice", "age": 30, "db_id": "1"})));
        assert_eq!(
            h.worker.identity().get_remote_id("users", "1").unwrap(),
            Some(records[0].record_id.clone())
        );
        assert_eq!(h.worker.queue().stats().unwrap().completed, 1);
    }

    #[test]
    fn test_relational_update_and_delete_follow_the_mapping() {
        let h = harness();
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        drain(&h);
        let remote_id = h.remote.records(REMOTE_TABLE)[0].record_id.clone();

        h.db.execute("UPDATE users SET name = 'B' WHERE id = 1", &[]).unwrap();
        drain(&h);
        let record = h.remote.get(REMOTE_TABLE, &remote_id).unwrap();
        assert_eq!(record.fields["姓名"], json!("B"));

        h.db.execute("DELETE FROM users WHERE id = 1", &[]).unwrap();
        drain(&h);
        assert!(h.remote.records(REMOTE_TABLE).is_empty());
        assert_eq!(h.worker.identity().count("users").unwrap(), 0);
    }

    #[test]
    fn test_relational_update_finds_unmapped_record_by_cross_reference() {
        let h = harness();
        h.remote.put(REMOTE_TABLE, "recX", obj(json!({"姓名": "A", "db_id": "1"})));
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        // Drop the insert so only the update replicates.
        let insert = h.worker.queue().dequeue_pending(1).unwrap().remove(0);
        h.worker.queue().mark_completed(insert.id).unwrap();

        h.db.execute("UPDATE users SET name = 'B' WHERE id = 1", &[]).unwrap();
        drain(&h);
        assert_eq!(h.remote.records(REMOTE_TABLE).len(), 1);
        assert_eq!(h.remote.get(REMOTE_TABLE, "recX").unwrap().fields["姓名"], json!("B"));
    }

    #[test]
    fn test_delete_of_missing_remote_record_succeeds() {
        let h = harness();
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        drain(&h);
        let remote_id = h.remote.records(REMOTE_TABLE)[0].record_id.clone();
        h.remote.remove(REMOTE_TABLE, &remote_id);

        h.db.execute("DELETE FROM users WHERE id = 1", &[]).unwrap();
        let outcomes = drain(&h);
        assert!(matches!(outcomes[..], [ApplyOutcome::Applied]));
    }

    #[test]
    fn test_retryable_failure_returns_item_to_pending_until_ceiling() {
        let h = harness();
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        h.remote.set_unavailable(true);

        for _ in 0..3 {
            let outcomes = drain(&h);
            assert!(matches!(outcomes[..], [ApplyOutcome::Failed(_)]));
        }
        let stats = h.worker.queue().stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert!(drain(&h).is_empty());
    }

    #[test]
    fn test_remote_write_is_not_echoed_back() {
        let h = harness();
        let event = remote_event("rec1", ChangeAction::Insert, Some(obj(json!({"姓名": "A", "age": 3}))));
        h.worker.apply_remote(&event);

        // The trigger enqueued the applied row; replicating it is an echo.
        let outcomes = drain(&h);
        assert!(matches!(outcomes[..], [ApplyOutcome::Skipped(_)]));
        assert_eq!(h.remote.write_count(), 0);
    }

    #[test]
    fn test_relational_write_is_not_echoed_back() {
        let h = harness();
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        drain(&h);
        let record = h.remote.records(REMOTE_TABLE).remove(0);

        let echo = remote_event(&record.record_id, ChangeAction::Insert, Some(record.fields));
        assert!(matches!(h.worker.apply_remote(&echo), ApplyOutcome::Skipped(_)));
        assert_eq!(h.worker.queue().stats().unwrap().pending, 0);
    }

    #[test]
    fn test_conflict_relational_priority_keeps_local_change() {
        let h = harness_with(ConflictStrategy::RelationalPriority);
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        drain(&h);
        let remote_id = h.remote.records(REMOTE_TABLE)[0].record_id.clone();

        h.db.execute("UPDATE users SET name = 'local' WHERE id = 1", &[]).unwrap();
        let event = remote_event(&remote_id, ChangeAction::Update, Some(obj(json!({"姓名": "remote"}))));
        assert!(matches!(h.worker.apply_remote(&event), ApplyOutcome::Skipped(_)));
        assert_eq!(user_names(&h.db), vec![json!("local")]);

        drain(&h);
        assert_eq!(h.remote.get(REMOTE_TABLE, &remote_id).unwrap().fields["姓名"], json!("local"));
    }

    #[test]
    fn test_conflict_remote_priority_supersedes_pending_item() {
        let h = harness_with(ConflictStrategy::RemotePriority);
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        drain(&h);
        let remote_id = h.remote.records(REMOTE_TABLE)[0].record_id.clone();

        h.remote.put(REMOTE_TABLE, &remote_id, obj(json!({"姓名": "remote", "db_id": "1"})));
        h.db.execute("UPDATE users SET name = 'local' WHERE id = 1", &[]).unwrap();
        let pending = h.worker.queue().pending_for_record("users", "1").unwrap().remove(0);
        let event = remote_event(&remote_id, ChangeAction::Update, Some(obj(json!({"姓名": "remote"}))));
        assert!(matches!(h.worker.apply_remote(&event), ApplyOutcome::Applied));

        assert_eq!(user_names(&h.db), vec![json!("remote")]);
        assert_eq!(
            h.worker.queue().get(pending.id).unwrap().unwrap().status,
            QueueStatus::Completed
        );
        // Only the echo of the remote change is left, and it is suppressed.
        let outcomes = drain(&h);
        assert!(matches!(outcomes[..], [ApplyOutcome::Skipped(_)]));
        assert_eq!(h.remote.get(REMOTE_TABLE, &remote_id).unwrap().fields["姓名"], json!("remote"));
    }

    #[test]
    fn test_conflict_remote_priority_supersedes_every_pending_item() {
        let h = harness_with(ConflictStrategy::RemotePriority);
        h.db.execute("INSERT INTO users (name, age) VALUES ('A', 25)", &[]).unwrap();
        drain(&h);
        let remote_id = h.remote.records(REMOTE_TABLE)[0].record_id.clone();

        h.db.execute("UPDATE users SET age = 26 WHERE id = 1", &[]).unwrap();
        h.db.execute("UPDATE users SET age = 27 WHERE id = 1", &[]).unwrap();
        let pending = h.worker.queue().pending_for_record("users", "1").unwrap();
        assert_eq!(pending.len(), 2);

        let fields = obj(json!({"姓名": "A", "age": 30, "db_id": "1"}));
        h.remote.put(REMOTE_TABLE, &remote_id, fields.clone());
        let event = remote_event(&remote_id, ChangeAction::Update, Some(fields));
        assert!(matches!(h.worker.apply_remote(&event), ApplyOutcome::Applied));

        for item in &pending {
            let item = h.worker.queue().get(item.id).unwrap().unwrap();
            assert_eq!(item.status, QueueStatus::Completed);
        }
        let writes = h.remote.write_count();
        drain(&h);
        assert_eq!(h.remote.write_count(), writes);
        let row = h.db.query_one("SELECT age FROM users WHERE id = 1", &[]).unwrap().unwrap();
        assert_eq!(row["age"], json!(30));
        assert_eq!(h.remote.get(REMOTE_TABLE, &remote_id).unwrap().fields["age"], json!(30));
    }

    #[test]
    fn test_last_write_wins_uses_detection_time() {
        let h = harness();
        h.db.execute("INSERT INTO users (name) VALUES ('A')", &[]).unwrap();
        drain(&h);
        let remote_id = h.remote.records(REMOTE_TABLE)[0].record_id.clone();

        h.db.execute("UPDATE users SET name = 'local' WHERE id = 1", &[]).unwrap();
        let mut stale = remote_event(&remote_id, ChangeAction::Update, Some(obj(json!({"姓名": "remote"}))));
        stale.detected_at = Utc::now() - Duration::hours(1);
        assert!(matches!(h.worker.apply_remote(&stale), ApplyOutcome::Skipped(_)));
        assert_eq!(user_names(&h.db), vec![json!("local")]);
    }

    #[test]
    fn test_table_without_remote_id_column_relies_on_identity_map() {
        let db = Database::open_in_memory().unwrap();
        db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT)", &[])
            .unwrap();
        install_capture_triggers(&db, "notes", "id").unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let notes = TableMapping::new("app:notes", "notes");
        let config = SyncConfig {
            tables: vec![notes.clone()],
            ..SyncConfig::default()
        };
        let worker = SyncWorker::new(db.clone(), remote.clone(), &config);
        let hasher = ContentHasher::for_table(&notes);
        let event = |action: ChangeAction, fields: Option<Fields>| ChangeEvent {
            record_id: "rec1".into(),
            table: "notes".into(),
            action,
            content_hash: fields.as_ref().map_or_else(|| hasher.tombstone("x"), |f| hasher.hash(f)),
            old_data: None,
            new_data: fields,
            detected_at: Utc::now(),
            source: ChangeSource::Remote,
        };

        let insert = event(ChangeAction::Insert, Some(obj(json!({"title": "draft"}))));
        assert!(matches!(worker.apply_remote(&insert), ApplyOutcome::Applied));
        let update = event(ChangeAction::Update, Some(obj(json!({"title": "final"}))));
        assert!(matches!(worker.apply_remote(&update), ApplyOutcome::Applied));
        let rows = db.query("SELECT id, title FROM notes", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("final"));
        assert_eq!(
            worker.identity().get_relational_id("notes", "rec1").unwrap(),
            Some("1".to_string())
        );

        assert!(matches!(
            worker.apply_remote(&event(ChangeAction::Delete, None)),
            ApplyOutcome::Applied
        ));
        assert!(db.query("SELECT id FROM notes", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_table_in_queue_is_retried() {
        let h = harness();
        let id = h
            .worker
            .queue()
            .enqueue("orders", "1", ChangeAction::Insert, None, Some(&obj(json!({"x": 1}))), None)
            .unwrap();
        let outcomes = drain(&h);
        assert!(matches!(outcomes[..], [ApplyOutcome::Failed(_)]));
        let item = h.worker.queue().get(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn test_missing_payload_is_abandoned() {
        let h = harness();
        let id = h
            .worker
            .queue()
            .enqueue("users", "1", ChangeAction::Update, None, None, None)
            .unwrap();
        let outcomes = drain(&h);
        assert!(matches!(outcomes[..], [ApplyOutcome::Failed(_)]));
        let item = h.worker.queue().get(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn test_remote_store_is_shared_through_trait_object() {
        let h = harness();
        let store: Arc<dyn RemoteStore> = h.remote.clone();
        assert!(store.ping().is_ok());
    }
}
