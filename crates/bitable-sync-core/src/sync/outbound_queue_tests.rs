//! Tests for outbound_queue module.

#[cfg(test)]
mod tests {
    use super::super::outbound_queue::*;
    use super::super::types::{ChangeAction, QueueStatus};
    use crate::remote::Fields;
    use crate::storage::Database;
    use serde_json::json;

    fn queue() -> (Database, OutboundQueue) {
        let db = Database::open_in_memory().unwrap();
        let queue = OutboundQueue::new(db.clone(), DEFAULT_MAX_RETRIES);
        (db, queue)
    }

    fn row(name: &str) -> Fields {
        json!({"id": 1, "name": name}).as_object().cloned().unwrap()
    }

    #[test]
    fn test_enqueue_and_dequeue_fifo() {
        let (_db, queue) = queue();
        let a = queue
            .enqueue("users", "1", ChangeAction::Insert, None, Some(&row("a")), None)
            .unwrap();
        let b = queue
            .enqueue("users", "2", ChangeAction::Insert, None, Some(&row("b")), Some("h"))
            .unwrap();

        let items = queue.dequeue_pending(10).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(items[0].content_hash, None);
        assert_eq!(items[1].content_hash.as_deref(), Some("h"));
        assert_eq!(items[0].new_data.as_ref().unwrap()["name"], json!("a"));
        assert_eq!(items[0].status, QueueStatus::Pending);

        // dequeue does not mark
        assert_eq!(queue.dequeue_pending(1).unwrap().len(), 1);
        assert_eq!(queue.dequeue_pending(10).unwrap().len(), 2);
    }

    #[test]
    fn test_retry_ceiling() {
        let (_db, queue) = queue();
        let id = queue
            .enqueue("users", "1", ChangeAction::Update, None, Some(&row("a")), None)
            .unwrap();

        assert_eq!(queue.mark_failed(id, "timeout").unwrap(), QueueStatus::Pending);
        assert_eq!(queue.mark_failed(id, "timeout").unwrap(), QueueStatus::Pending);
        assert_eq!(queue.mark_failed(id, "timeout").unwrap(), QueueStatus::Failed);

        let item = queue.get(id).unwrap().unwrap();
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.error_message.as_deref(), Some("timeout"));
        assert!(queue.dequeue_pending(10).unwrap().is_empty());
    }

    #[test]
    fn test_abandon_is_terminal() {
        let (_db, queue) = queue();
        let id = queue
            .enqueue("users", "1", ChangeAction::Insert, None, Some(&row("a")), None)
            .unwrap();
        queue.abandon(id, "cannot translate").unwrap();

        let item = queue.get(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
        assert!(queue.dequeue_pending(10).unwrap().is_empty());
    }

    #[test]
    fn test_processing_is_not_dequeued_until_recovered() {
        let (_db, queue) = queue();
        let id = queue
            .enqueue("users", "1", ChangeAction::Delete, Some(&row("a")), None, None)
            .unwrap();
        queue.mark_processing(id).unwrap();
        assert!(queue.dequeue_pending(10).unwrap().is_empty());

        assert_eq!(queue.recover_processing().unwrap(), 1);
        assert_eq!(queue.dequeue_pending(10).unwrap().len(), 1);
    }

    #[test]
    fn test_pending_for_record_lists_newest_first() {
        let (_db, queue) = queue();
        let older = queue
            .enqueue("users", "1", ChangeAction::Insert, None, Some(&row("a")), None)
            .unwrap();
        let newer = queue
            .enqueue("users", "1", ChangeAction::Update, None, Some(&row("b")), None)
            .unwrap();
        queue
            .enqueue("users", "2", ChangeAction::Insert, None, Some(&row("c")), None)
            .unwrap();

        let ids: Vec<i64> = queue
            .pending_for_record("users", "1")
            .unwrap()
            .iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec![newer, older]);

        queue.mark_completed(newer).unwrap();
        let ids: Vec<i64> = queue
            .pending_for_record("users", "1")
            .unwrap()
            .iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec![older]);
        assert!(queue.pending_for_record("orders", "1").unwrap().is_empty());
    }

    #[test]
    fn test_stats_and_list() {
        let (_db, queue) = queue();
        let a = queue
            .enqueue("users", "1", ChangeAction::Insert, None, Some(&row("a")), None)
            .unwrap();
        let b = queue
            .enqueue("users", "2", ChangeAction::Insert, None, Some(&row("b")), None)
            .unwrap();
        queue
            .enqueue("users", "3", ChangeAction::Insert, None, Some(&row("c")), None)
            .unwrap();
        queue.mark_completed(a).unwrap();
        queue.abandon(b, "bad").unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(
            (stats.pending, stats.completed, stats.failed, stats.total),
            (1, 1, 1, 3)
        );
        assert!(stats.oldest_pending.is_some());

        assert_eq!(queue.list(Some(QueueStatus::Failed), 10).unwrap()[0].id, b);
        assert_eq!(queue.list(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_cleanup_removes_old_completed_only() {
        let (db, queue) = queue();
        let done = queue
            .enqueue("users", "1", ChangeAction::Insert, None, Some(&row("a")), None)
            .unwrap();
        let failed = queue
            .enqueue("users", "2", ChangeAction::Insert, None, Some(&row("b")), None)
            .unwrap();
        queue.mark_completed(done).unwrap();
        queue.abandon(failed, "bad").unwrap();
        db.execute(
            "UPDATE sync_queue SET processed_at = '2000-01-01T00:00:00.000Z'",
            &[],
        )
        .unwrap();

        assert_eq!(queue.cleanup(chrono::Duration::days(7)).unwrap(), 1);
        assert!(queue.get(done).unwrap().is_none());
        assert!(queue.get(failed).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let (db, queue) = queue();
        db.execute(
            "INSERT INTO sync_queue (table_name, record_id, action, new_data) VALUES ('users', '1', 'insert', '{oops')",
            &[],
        )
        .unwrap();
        let err = queue.dequeue_pending(10).unwrap_err();
        assert!(matches!(err, crate::error::DatabaseError::Corrupt { .. }));
    }
}
