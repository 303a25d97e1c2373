//! Durable work queue with atomic claim (spec §4.2).
//!
//! Claiming is a single conditional `UPDATE ... RETURNING` against
//! `work_queue`, the way the teacher reaches for one statement rather than a
//! SELECT-then-UPDATE pair whenever an operation has to be atomic under
//! concurrent access. `RETURNING` needs the `modern_sqlite` rusqlite feature.

use crate::error::IngestError;
use crate::models::{WorkItem, WorkItemStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

pub struct WorkQueue {
    conn: Arc<Mutex<Connection>>,
}

impl WorkQueue {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Atomically claims the oldest pending item for `worker_id`, or `None`
    /// if the queue is empty. Safe to call from many workers concurrently.
    pub fn claim(&self, worker_id: &str) -> Result<Option<WorkItem>, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let row = conn
            .query_row(
                "UPDATE work_queue
                 SET status = 'processing', worker_id = ?1, started_at = datetime('now')
                 WHERE id = (
                     SELECT id FROM work_queue
                     WHERE status = 'pending'
                     ORDER BY id ASC
                     LIMIT 1
                 )
                 RETURNING id, file_id, file_path, content_hash, project_context, status, worker_id",
                params![worker_id],
                row_to_work_item,
            )
            .optional()?;
        Ok(row)
    }

    /// Same guard as `claim`, but targeted at a specific item: atomically
    /// transitions `id` from `pending` to `processing` for `worker_id`, or
    /// returns `None` if it isn't pending (already claimed, or doesn't
    /// exist).
    pub fn claim_specific(&self, id: i64, worker_id: &str) -> Result<Option<WorkItem>, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let row = conn
            .query_row(
                "UPDATE work_queue
                 SET status = 'processing', worker_id = ?1, started_at = datetime('now')
                 WHERE id = ?2 AND status = 'pending'
                 RETURNING id, file_id, file_path, content_hash, project_context, status, worker_id",
                params![worker_id, id],
                row_to_work_item,
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_completed(&self, id: i64) -> Result<(), IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE work_queue SET status = 'completed', completed_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: i64) -> Result<(), IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE work_queue SET status = 'failed', completed_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Re-queues an item for another attempt (spec §4.4 retry loop).
    pub fn requeue(&self, id: i64) -> Result<(), IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE work_queue SET status = 'pending', worker_id = NULL, started_at = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn pending_count(&self) -> Result<i64, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM work_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_work_item(row: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        file_id: row.get(1)?,
        file_path: row.get(2)?,
        content_hash: row.get(3)?,
        project_context: row.get(4)?,
        status: WorkItemStatus::parse_str(&row.get::<_, String>(5)?),
        worker_id: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO work_queue (project_id, file_id, file_path, content_hash, status)
             VALUES ('p', 'f1', '/repo/a.rs', 'h1', 'pending')",
            [],
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[test]
    fn claim_returns_pending_item() {
        let conn = setup();
        let q = WorkQueue::new(conn);
        let item = q.claim("w1").unwrap().unwrap();
        assert_eq!(item.file_path, "/repo/a.rs");
        assert_eq!(item.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn claim_on_empty_queue_returns_none() {
        let conn = setup();
        let q = WorkQueue::new(conn);
        q.claim("w1").unwrap();
        assert!(q.claim("w2").unwrap().is_none());
    }

    #[test]
    fn requeue_makes_item_claimable_again() {
        let conn = setup();
        let q = WorkQueue::new(conn);
        let item = q.claim("w1").unwrap().unwrap();
        q.requeue(item.id).unwrap();
        let item2 = q.claim("w2").unwrap().unwrap();
        assert_eq!(item2.id, item.id);
    }

    #[test]
    fn mark_completed_removes_item_from_pending() {
        let conn = setup();
        let q = WorkQueue::new(conn);
        let item = q.claim("w1").unwrap().unwrap();
        q.mark_completed(item.id).unwrap();
        assert_eq!(q.pending_count().unwrap(), 0);
    }

    #[test]
    fn claim_specific_claims_the_targeted_pending_item() {
        let conn = setup();
        let pending_id: i64 = conn
            .lock()
            .unwrap()
            .query_row("SELECT id FROM work_queue", [], |r| r.get(0))
            .unwrap();
        let q = WorkQueue::new(conn);

        let item = q.claim_specific(pending_id, "w1").unwrap().unwrap();
        assert_eq!(item.id, pending_id);
        assert_eq!(item.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn claim_specific_returns_none_when_already_claimed() {
        let conn = setup();
        let q = WorkQueue::new(conn);
        let item = q.claim("w1").unwrap().unwrap();
        assert!(q.claim_specific(item.id, "w2").unwrap().is_none());
    }

    #[test]
    fn claim_specific_returns_none_for_nonexistent_id() {
        let conn = setup();
        let q = WorkQueue::new(conn);
        assert!(q.claim_specific(9999, "w1").unwrap().is_none());
    }
}
