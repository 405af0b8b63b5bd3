//! Relational change capture.
//!
//! `AFTER INSERT/UPDATE/DELETE` triggers copy every write to a user table
//! into `sync_queue` as a JSON snapshot of the row. Hashing is left to the
//! worker, so the trigger-enqueued `content_hash` is NULL.

use crate::error::DatabaseError;
use crate::storage::database::quote_ident;
use crate::storage::Database;

const TRIGGER_PREFIX: &str = "bitable_sync";

fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn trigger_name(table: &str, suffix: &str) -> String {
    quote_ident(&format!("{TRIGGER_PREFIX}_{table}_{suffix}"))
}

/// `json_object('a', NEW."a", ...)` with blobs rendered as hex.
fn row_json(columns: &[String], alias: &str) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| {
            let col = format!("{alias}.{}", quote_ident(c));
            format!(
                "{}, CASE WHEN typeof({col}) = 'blob' THEN lower(hex({col})) ELSE {col} END",
                sql_literal(c)
            )
        })
        .collect();
    format!("json_object({})", pairs.join(", "))
}

/// Install (or refresh) capture triggers on `table`, keyed by `key_column`.
///
/// Re-run after adding columns so the row snapshot includes them.
///
/// # Errors
/// Returns an error if the table or key column does not exist or the
/// triggers cannot be created.
pub fn install_capture_triggers(db: &Database, table: &str, key_column: &str) -> Result<(), DatabaseError> {
    let columns = db.table_columns(table)?;
    if columns.is_empty() {
        return Err(DatabaseError::QueryFailed(format!("table '{table}' does not exist")));
    }
    if !columns.iter().any(|c| c == key_column) {
        return Err(DatabaseError::QueryFailed(format!(
            "table '{table}' has no key column '{key_column}'"
        )));
    }

    let quoted_table = quote_ident(table);
    let name = sql_literal(table);
    let key = quote_ident(key_column);
    let new_row = row_json(&columns, "NEW");
    let old_row = row_json(&columns, "OLD");

    let sql = format!(
        "DROP TRIGGER IF EXISTS {ai};
         DROP TRIGGER IF EXISTS {au};
         DROP TRIGGER IF EXISTS {ad};

         CREATE TRIGGER {ai} AFTER INSERT ON {quoted_table} BEGIN
            INSERT INTO sync_queue (table_name, record_id, action, new_data)
            VALUES ({name}, CAST(NEW.{key} AS TEXT), 'insert', {new_row});
         END;

         CREATE TRIGGER {au} AFTER UPDATE ON {quoted_table} BEGIN
            INSERT INTO sync_queue (table_name, record_id, action, old_data, new_data)
            VALUES ({name}, CAST(NEW.{key} AS TEXT), 'update', {old_row}, {new_row});
         END;

         CREATE TRIGGER {ad} AFTER DELETE ON {quoted_table} BEGIN
            INSERT INTO sync_queue (table_name, record_id, action, old_data)
            VALUES ({name}, CAST(OLD.{key} AS TEXT), 'delete', {old_row});
         END;",
        ai = trigger_name(table, "ai"),
        au = trigger_name(table, "au"),
        ad = trigger_name(table, "ad"),
    );
    db.with_transaction(|conn| conn.execute_batch(&sql))?;
    tracing::info!(table, columns = columns.len(), "installed change capture triggers");
    Ok(())
}

/// Drop the capture triggers of `table`, if present.
///
/// # Errors
/// Returns an error if a trigger cannot be dropped.
pub fn remove_capture_triggers(db: &Database, table: &str) -> Result<(), DatabaseError> {
    let sql = ["ai", "au", "ad"]
        .iter()
        .map(|suffix| format!("DROP TRIGGER IF EXISTS {};", trigger_name(table, suffix)))
        .collect::<Vec<_>>()
        .join("\n");
    db.with_conn(|conn| conn.execute_batch(&sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::outbound_queue::OutboundQueue;
    use crate::sync::types::ChangeAction;
    use serde_json::json;

    fn setup() -> (Database, OutboundQueue) {
        let db = Database::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, avatar BLOB, feishu_id TEXT)",
            &[],
        )
        .unwrap();
        install_capture_triggers(&db, "users", "id").unwrap();
        let queue = OutboundQueue::new(db.clone(), 3);
        (db, queue)
    }

    #[test]
    fn test_writes_are_enqueued_with_row_snapshots() {
        let (db, queue) = setup();
        db.execute("INSERT INTO users (name, age) VALUES ('Alice', 25)", &[])
            .unwrap();
        db.execute("UPDATE users SET age = 26 WHERE id = 1", &[]).unwrap();
        db.execute("DELETE FROM users WHERE id = 1", &[]).unwrap();

        let items = queue.dequeue_pending(10).unwrap();
        let actions: Vec<_> = items.iter().map(|i| i.action).collect();
        assert_eq!(
            actions,
            vec![ChangeAction::Insert, ChangeAction::Update, ChangeAction::Delete]
        );
        assert!(items.iter().all(|i| i.record_id == "1" && i.content_hash.is_none()));

        let inserted = items[0].new_data.as_ref().unwrap();
        assert_eq!(inserted["name"], json!("Alice"));
        assert_eq!(inserted["age"], json!(25));
        assert_eq!(inserted["feishu_id"], json!(null));

        assert_eq!(items[1].old_data.as_ref().unwrap()["age"], json!(25));
        assert_eq!(items[1].new_data.as_ref().unwrap()["age"], json!(26));
        assert_eq!(items[2].old_data.as_ref().unwrap()["age"], json!(26));
        assert!(items[2].new_data.is_none());
    }

    #[test]
    fn test_blob_columns_do_not_break_writes() {
        let (db, queue) = setup();
        db.execute("INSERT INTO users (name, avatar) VALUES ('B', x'00ff')", &[])
            .unwrap();
        let items = queue.dequeue_pending(10).unwrap();
        assert_eq!(items[0].new_data.as_ref().unwrap()["avatar"], json!("00ff"));
    }

    #[test]
    fn test_reinstall_and_remove() {
        let (db, queue) = setup();
        install_capture_triggers(&db, "users", "id").unwrap();
        db.execute("INSERT INTO users (name) VALUES ('C')", &[]).unwrap();
        assert_eq!(queue.dequeue_pending(10).unwrap().len(), 1);

        remove_capture_triggers(&db, "users").unwrap();
        db.execute("INSERT INTO users (name) VALUES ('D')", &[]).unwrap();
        assert_eq!(queue.dequeue_pending(10).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_table_or_key_is_rejected() {
        let (db, _) = setup();
        assert!(install_capture_triggers(&db, "orders", "id").is_err());
        assert!(install_capture_triggers(&db, "users", "uuid").is_err());
    }
}
