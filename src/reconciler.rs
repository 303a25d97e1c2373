//! Self-cleaning reconciler (spec §4.7): a two-phase, stop-the-world sweep
//! over `files`, independent of the per-run `refactoring_tasks` mechanism
//! (spec §4.6, handled by `graph::ingestor::GraphIngestor` on every run).
//! Mark flips any file whose row is still active but whose bytes are gone
//! from disk to `pending_deletion`; sweep purges the graph first and only
//! deletes the relational row once the graph step has succeeded, so a crash
//! between the two never leaves a dangling graph node with no relational
//! record to retry from.

use crate::error::IngestError;
use crate::graph::GraphStore;
use crate::models::FileStatus;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub marked_for_deletion: usize,
    pub deletions_applied: usize,
}

pub struct SelfCleaningReconciler {
    store: Arc<dyn GraphStore>,
    conn: Arc<Mutex<Connection>>,
}

impl SelfCleaningReconciler {
    pub fn new(store: Arc<dyn GraphStore>, conn: Arc<Mutex<Connection>>) -> Self {
        Self { store, conn }
    }

    /// Mark phase: for every file not already `pending_deletion`, check
    /// filesystem existence of its absolute path; flip to `pending_deletion`
    /// if the file is gone (spec §4.7).
    pub fn mark(&self) -> Result<usize, IngestError> {
        let candidates = {
            let conn = self.conn.lock().expect("db mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT id, absolute_path FROM files WHERE status != ?1",
            )?;
            let rows = stmt.query_map(params![FileStatus::PendingDeletion.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut marked = 0;
        for (id, absolute_path) in candidates {
            if !Path::new(&absolute_path).exists() {
                let conn = self.conn.lock().expect("db mutex poisoned");
                conn.execute(
                    "UPDATE files SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![FileStatus::PendingDeletion.as_str(), id],
                )?;
                marked += 1;
            }
        }

        Ok(marked)
    }

    /// Sweep phase: collect every `pending_deletion` path, delete the
    /// corresponding graph subtree, then (only on graph success) delete the
    /// relational rows (spec §4.7). Aborts without touching `files` if the
    /// graph step fails.
    pub async fn run(&self) -> Result<ReconcileReport, IngestError> {
        let marked = self.mark()?;
        let paths = self.load_pending_deletion_paths()?;

        let mut report = ReconcileReport {
            marked_for_deletion: marked,
            ..Default::default()
        };

        if paths.is_empty() {
            info!(?report, "reconcile pass complete, nothing to sweep");
            return Ok(report);
        }

        let mut qualified_names = Vec::new();
        for path in &paths {
            qualified_names.extend(self.store.list_qualified_names_under(path).await?);
        }

        if let Err(e) = self.store.delete_nodes(&qualified_names).await {
            warn!(error = %e, "reconcile graph-side deletion failed, relational files untouched");
            return Err(IngestError::ReconcileGraphError(e.to_string()));
        }

        let conn = self.conn.lock().expect("db mutex poisoned");
        for path in &paths {
            conn.execute("DELETE FROM files WHERE absolute_path = ?1", params![path])?;
        }
        report.deletions_applied = paths.len();

        info!(?report, "reconcile pass complete");
        Ok(report)
    }

    fn load_pending_deletion_paths(&self) -> Result<Vec<String>, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT absolute_path FROM files WHERE status = ?1",
        )?;
        let rows = stmt.query_map(params![FileStatus::PendingDeletion.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FakeGraphStore, GraphBatch};
    use crate::models::{NodeType, Poi};
    use crate::schema::run_migrations;
    use std::fs;

    fn setup(path: &str) -> (SelfCleaningReconciler, Arc<Mutex<Connection>>, Arc<FakeGraphStore>) {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO files (id, project_id, path, absolute_path, content_hash) \
             VALUES ('f1', 'p', 'a.rs', ?1, 'h1')",
            params![path],
        )
        .unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let store = Arc::new(FakeGraphStore::new());
        let reconciler = SelfCleaningReconciler::new(store.clone(), conn.clone());
        (reconciler, conn, store)
    }

    #[tokio::test]
    async fn mark_flips_status_when_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        let (reconciler, conn, _store) = setup(path.to_str().unwrap());
        // never created on disk: already missing.

        let marked = reconciler.mark().unwrap();
        assert_eq!(marked, 1);

        let status: String = conn
            .lock()
            .unwrap()
            .query_row("SELECT status FROM files WHERE id = 'f1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "pending_deletion");
    }

    #[tokio::test]
    async fn mark_leaves_status_untouched_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        fs::write(&path, "fn main() {}").unwrap();
        let (reconciler, conn, _store) = setup(path.to_str().unwrap());

        let marked = reconciler.mark().unwrap();
        assert_eq!(marked, 0);

        let status: String = conn
            .lock()
            .unwrap()
            .query_row("SELECT status FROM files WHERE id = 'f1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "pending");
    }

    #[tokio::test]
    async fn run_purges_graph_then_relational_row_for_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        let (reconciler, conn, store) = setup(path.to_str().unwrap());

        store
            .apply_batch(&GraphBatch {
                upsert_nodes: vec![Poi {
                    qualified_name: format!("{}--f", path.to_str().unwrap()),
                    name: "f".to_string(),
                    node_type: NodeType::Function,
                    file_path: path.to_str().unwrap().to_string(),
                    start_line: Some(1),
                    end_line: Some(2),
                    is_exported: false,
                    signature: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.marked_for_deletion, 1);
        assert_eq!(report.deletions_applied, 1);
        assert_eq!(store.node_count(), 0);

        let remaining: i64 = conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn run_on_unchanged_tree_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        fs::write(&path, "fn main() {}").unwrap();
        let (reconciler, _conn, _store) = setup(path.to_str().unwrap());

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.marked_for_deletion, 0);
        assert_eq!(report.deletions_applied, 0);
    }
}
