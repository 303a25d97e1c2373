//! Applies resolved analysis results to the graph store and reflects the
//! outcome back onto `analysis_results` (spec §4.6): refactoring deletions
//! are applied first, then the accumulated node/relationship batch; a
//! failed graph commit leaves the relational rows untouched so the next run
//! retries from `pending_ingestion`.

use super::{GraphBatch, GraphStore};
use crate::error::IngestError;
use crate::models::{AnalysisResultStatus, Poi, RefactoringKind, RefactoringStatus, RelationshipRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Outcome of one `apply_refactoring_tasks` pass (spec §4.6 step 1).
#[derive(Debug, Default, Clone)]
pub struct RefactorReport {
    pub deletions: usize,
    pub renames: usize,
}

pub struct GraphIngestor {
    store: Arc<dyn GraphStore>,
    conn: Arc<Mutex<Connection>>,
}

impl GraphIngestor {
    pub fn new(store: Arc<dyn GraphStore>, conn: Arc<Mutex<Connection>>) -> Self {
        Self { store, conn }
    }

    /// Applies every pending `refactoring_tasks` row (spec §4.6 step 1):
    /// DELETE drops the graph subtree under the old path and then removes
    /// the relational `files` row (graph-first, so a crash before the
    /// relational delete simply retries a now-idempotent graph delete);
    /// RENAME rewrites `filePath`/`qualifiedName` in place, leaving node
    /// identity and incident relationships untouched. Runs unconditionally
    /// at the start of every ingest pass, ahead of node/edge upserts,
    /// regardless of whether the optional self-cleaning reconciler runs.
    pub async fn apply_refactoring_tasks(&self, project_id: &str) -> Result<RefactorReport, IngestError> {
        let tasks = self.load_pending_refactoring_tasks(project_id)?;
        let mut report = RefactorReport::default();

        for (id, kind, old_path, new_path) in tasks {
            match kind {
                RefactoringKind::Delete => match self.apply_delete(&old_path).await {
                    Ok(()) => {
                        self.mark_refactor_completed(id)?;
                        report.deletions += 1;
                    }
                    Err(e) => {
                        warn!(task_id = id, error = %e, "refactor delete failed, leaving task pending");
                    }
                },
                RefactoringKind::Rename => {
                    let Some(new_path) = new_path else {
                        warn!(task_id = id, "rename task missing new_absolute_path, skipping");
                        continue;
                    };
                    match self.store.rename_path(&old_path, &new_path).await {
                        Ok(()) => {
                            self.mark_refactor_completed(id)?;
                            report.renames += 1;
                        }
                        Err(e) => {
                            warn!(task_id = id, error = %e, "refactor rename failed, leaving task pending");
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn apply_delete(&self, old_path: &str) -> Result<(), IngestError> {
        let qualified_names = self.store.list_qualified_names_under(old_path).await?;
        self.store.delete_nodes(&qualified_names).await?;

        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute("DELETE FROM files WHERE absolute_path = ?1", params![old_path])?;
        Ok(())
    }

    fn load_pending_refactoring_tasks(
        &self,
        project_id: &str,
    ) -> Result<Vec<(i64, RefactoringKind, String, Option<String>)>, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, kind, old_absolute_path, new_absolute_path FROM refactoring_tasks \
             WHERE project_id = ?1 AND status = ?2",
        )?;
        let rows = stmt.query_map(params![project_id, RefactoringStatus::Pending.as_str()], |row| {
            let kind_str: String = row.get(1)?;
            Ok((
                row.get::<_, i64>(0)?,
                RefactoringKind::parse_str(&kind_str),
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn mark_refactor_completed(&self, id: i64) -> Result<(), IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE refactoring_tasks SET status = ?1 WHERE id = ?2",
            params![RefactoringStatus::Completed.as_str(), id],
        )?;
        Ok(())
    }

    /// The `analysis_results.id` for `work_item_id`'s most recent
    /// `pending_ingestion` row, if the batch processor has already flushed
    /// it (spec §4.6: the ingestor reads `pending_ingestion` rows written by
    /// the batch processor).
    pub fn pending_result_id(&self, work_item_id: i64) -> Result<Option<i64>, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let id = conn
            .query_row(
                "SELECT id FROM analysis_results WHERE work_item_id = ?1 AND status = ?2 ORDER BY id DESC LIMIT 1",
                params![work_item_id, AnalysisResultStatus::PendingIngestion.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Ingests one result's resolved entities/relationships. On success,
    /// marks the relational row `ingested`; on failure, leaves it at
    /// `pending_ingestion` and returns the error so the caller can decide
    /// whether to retry the whole run.
    pub async fn ingest(
        &self,
        analysis_result_id: i64,
        nodes: Vec<Poi>,
        relationships: Vec<RelationshipRecord>,
    ) -> Result<(), IngestError> {
        let batch = GraphBatch {
            upsert_nodes: nodes,
            upsert_relationships: relationships,
            delete_qualified_names: Vec::new(),
        };

        match self.store.apply_batch(&batch).await {
            Ok(()) => {
                self.mark_ingested(analysis_result_id, batch.upsert_nodes.len(), batch.upsert_relationships.len())?;
                info!(analysis_result_id, "analysis result ingested into graph");
                Ok(())
            }
            Err(e) => {
                warn!(analysis_result_id, error = %e, "graph commit failed, leaving result pending");
                Err(e)
            }
        }
    }

    /// Commits cross-file relationships discovered by the three-pass
    /// resolver (spec §4.5) directly: unlike per-file entities/relationships,
    /// they aren't owned by a single `analysis_results` row, so there is
    /// nothing to mark ingested here — only the graph-side commit applies.
    pub async fn ingest_relationships(&self, relationships: Vec<RelationshipRecord>) -> Result<(), IngestError> {
        if relationships.is_empty() {
            return Ok(());
        }
        let batch = GraphBatch {
            upsert_nodes: Vec::new(),
            upsert_relationships: relationships,
            delete_qualified_names: Vec::new(),
        };
        self.store.apply_batch(&batch).await
    }

    fn mark_ingested(&self, id: i64, entities: usize, relationships: usize) -> Result<(), IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE analysis_results SET status = ?1, entities_count = ?2, relationships_count = ?3, \
             updated_at = datetime('now') WHERE id = ?4",
            params![
                AnalysisResultStatus::Ingested.as_str(),
                entities as i64,
                relationships as i64,
                id,
            ],
        )?;
        Ok(())
    }
}
