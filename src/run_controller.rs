//! Phase orchestration (spec §4.8): Scout, then drain the worker fleet
//! through the batch processor, then apply pending refactoring tasks and
//! resolve/ingest relationships, then (optionally) reconcile. Each phase's
//! failures are aggregated into the final report rather than aborting the
//! run outright, except a Scout failure, which is fatal since nothing
//! downstream has anything to do without it.

use crate::batch::BatchProcessor;
use crate::config::Config;
use crate::error::IngestError;
use crate::graph::ingestor::GraphIngestor;
use crate::graph::GraphStore;
use crate::llm::LlmClient;
use crate::models::{NodeType, Poi};
use crate::queue::WorkQueue;
use crate::reconciler::SelfCleaningReconciler;
use crate::resolver::RelationshipResolver;
use crate::scout::{ScanReport, Scout};
use crate::worker::{FailedWork, ProcessedWork, WorkOutcome, WorkerFleet};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub scan: Option<ScanReport>,
    pub work_items_processed: usize,
    pub work_items_failed: usize,
    pub entities_ingested: usize,
    pub relationships_ingested: usize,
    pub refactor_deletions: usize,
    pub refactor_renames: usize,
    pub reconcile_marked: usize,
    pub reconcile_deletions: usize,
    pub resolver_pass1_relationships: usize,
    pub resolver_pass2_relationships: usize,
    pub resolver_pass3_relationships: usize,
}

pub struct RunController {
    config: Config,
    conn: Arc<Mutex<Connection>>,
    scout: Scout,
    queue: Arc<WorkQueue>,
    workers: WorkerFleet,
    llm: Arc<dyn LlmClient>,
    graph: Arc<dyn GraphStore>,
    analysis_batch: BatchProcessor<ProcessedWork>,
    failed_batch: BatchProcessor<FailedWork>,
    cancelled: Arc<AtomicBool>,
}

impl RunController {
    pub fn new(config: Config, conn: Arc<Mutex<Connection>>, llm: Arc<dyn LlmClient>, graph: Arc<dyn GraphStore>) -> Self {
        let scout = Scout::new(conn.clone(), config.project_id.clone());
        let queue = Arc::new(WorkQueue::new(conn.clone()));
        let workers = WorkerFleet::new(queue.clone(), llm.clone(), config.clone());
        let analysis_batch = BatchProcessor::new(config.queue_capacity, config.batch_size, config.flush_interval);
        let failed_batch = BatchProcessor::new(config.queue_capacity, config.batch_size, config.flush_interval);

        Self {
            config,
            conn,
            scout,
            queue,
            workers,
            llm,
            graph,
            analysis_batch,
            failed_batch,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation flag: checked between work items and between
    /// phases, never mid-write.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn run(&self, target_dir: &PathBuf) -> Result<RunReport, IngestError> {
        let mut report = RunReport::default();

        let scan = self.scout.scan(target_dir)?;
        info!(?scan, "scout phase complete");
        report.scan = Some(scan);

        if self.is_cancelled() {
            return Ok(report);
        }

        // Refactoring tasks (renames/deletes emitted by the Scout's change
        // analyzer) apply unconditionally on every run, ahead of ingestion,
        // regardless of whether the optional mark/sweep reconciler runs
        // (spec §4.6 step 1).
        let ingestor = GraphIngestor::new(self.graph.clone(), self.conn.clone());
        let refactor = ingestor.apply_refactoring_tasks(&self.config.project_id).await?;
        report.refactor_deletions = refactor.deletions;
        report.refactor_renames = refactor.renames;

        if self.is_cancelled() {
            return Ok(report);
        }

        let processed = self.drain_worker_fleet(&mut report).await?;

        if !self.is_cancelled() && self.config.run_relationship_resolver {
            self.resolve_and_ingest(&ingestor, processed, &mut report).await?;
        }

        if !self.is_cancelled() && self.config.reconcile_on_run {
            let reconciler = SelfCleaningReconciler::new(self.graph.clone(), self.conn.clone());
            let reconcile = reconciler.run().await?;
            report.reconcile_marked = reconcile.marked_for_deletion;
            report.reconcile_deletions = reconcile.deletions_applied;
        }

        Ok(report)
    }

    /// Drains the queue through the worker fleet, routing every outcome
    /// through the batch processor (spec §4.3 `queueAnalysisResult` /
    /// `queueFailedWork`) rather than writing directly from the worker.
    /// Flushes by size as the loop runs and force-flushes whatever remains
    /// once the queue is empty, so `analysis_results` rows are committed and
    /// visible to the ingestion phase that follows.
    async fn drain_worker_fleet(&self, report: &mut RunReport) -> Result<Vec<ProcessedWork>, IngestError> {
        let mut completed = Vec::new();
        let worker_id = "fleet";

        loop {
            if self.is_cancelled() {
                break;
            }
            match self.workers.process_next(worker_id).await? {
                Some(WorkOutcome::Completed(work)) => {
                    report.work_items_processed += 1;
                    completed.push(work.clone());
                    self.analysis_batch
                        .push(work, |batch| self.write_analysis_results(batch))?;
                    if self.analysis_batch.should_flush_by_size() {
                        self.analysis_batch.flush(|batch| self.write_analysis_results(batch))?;
                    }
                }
                Some(WorkOutcome::Failed(failed)) => {
                    report.work_items_failed += 1;
                    self.failed_batch
                        .push(failed, |batch| self.write_failed_work(batch))?;
                    if self.failed_batch.should_flush_by_size() {
                        self.failed_batch.flush(|batch| self.write_failed_work(batch))?;
                    }
                }
                None => break,
            }
        }

        self.analysis_batch.shutdown(|batch| self.write_analysis_results(batch))?;
        self.failed_batch.shutdown(|batch| self.write_failed_work(batch))?;

        Ok(completed)
    }

    fn write_analysis_results(&self, batch: &[ProcessedWork]) -> Result<(), IngestError> {
        let mut conn = self.conn.lock().expect("db mutex poisoned");
        let tx = conn.transaction()?;
        for work in batch {
            let llm_output = serde_json::to_string(&work.payload).unwrap_or_default();
            tx.execute(
                "INSERT INTO analysis_results \
                 (project_id, work_item_id, file_path, absolute_file_path, llm_output, retry_count, processing_duration_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    self.config.project_id,
                    work.work_item_id,
                    work.file_path,
                    work.file_path,
                    llm_output,
                    work.retry_count,
                    work.duration_ms,
                ],
            )?;
            tx.execute(
                "UPDATE work_queue SET status = 'completed', completed_at = datetime('now') WHERE id = ?1",
                params![work.work_item_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn write_failed_work(&self, batch: &[FailedWork]) -> Result<(), IngestError> {
        let mut conn = self.conn.lock().expect("db mutex poisoned");
        let tx = conn.transaction()?;
        for f in batch {
            tx.execute(
                "INSERT INTO failed_work \
                 (project_id, work_item_id, error_message, error_type, retry_count, last_retry_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
                params![
                    self.config.project_id,
                    f.work_item_id,
                    f.error_message,
                    f.error_type,
                    f.retry_count,
                ],
            )?;
            tx.execute(
                "UPDATE work_queue SET status = 'failed', completed_at = datetime('now') WHERE id = ?1",
                params![f.work_item_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn resolve_and_ingest(
        &self,
        ingestor: &GraphIngestor,
        processed: Vec<ProcessedWork>,
        report: &mut RunReport,
    ) -> Result<(), IngestError> {
        let mut resolver = RelationshipResolver::new();
        let mut pois_by_file: Vec<(String, Vec<Poi>)> = Vec::new();

        for work in &processed {
            let pois: Vec<Poi> = work
                .payload
                .entities
                .iter()
                .filter_map(|e| {
                    let node_type = NodeType::try_from(e.entity_type.as_str()).ok()?;
                    Some(Poi {
                        qualified_name: Poi::qualified_name_for(node_type, &work.file_path, &e.name),
                        name: e.name.clone(),
                        node_type,
                        file_path: work.file_path.clone(),
                        start_line: e.start_line,
                        end_line: e.end_line,
                        is_exported: e.is_exported,
                        signature: e.signature.clone(),
                    })
                })
                .collect();
            resolver.register(&pois);
            pois_by_file.push((work.file_path.clone(), pois));
        }

        for (work, (file_path, pois)) in processed.iter().zip(pois_by_file.iter()) {
            let relationships: Vec<_> = work
                .payload
                .relationships
                .iter()
                .filter_map(|r| resolver.resolve(file_path, r))
                .collect();
            let relationships = RelationshipResolver::dedup(relationships);

            report.entities_ingested += pois.len();
            report.relationships_ingested += relationships.len();

            match ingestor.pending_result_id(work.work_item_id)? {
                Some(analysis_result_id) => {
                    ingestor.ingest(analysis_result_id, pois.clone(), relationships).await?;
                }
                None => {
                    warn!(
                        work_item_id = work.work_item_id,
                        "no flushed analysis_results row found, skipping ingestion for this item"
                    );
                }
            }
        }

        // Spec §4.5: the resolver's own three ordered LLM passes over the
        // POIs just persisted, discovering cross-file relationships the
        // worker's single-file view never saw. Not owned by any one
        // `analysis_results` row, so committed to the graph directly.
        let (cross_file, pass_report) = resolver.run_three_pass(self.llm.as_ref(), &pois_by_file).await;
        report.resolver_pass1_relationships = pass_report.pass1_relationships;
        report.resolver_pass2_relationships = pass_report.pass2_relationships;
        report.resolver_pass3_relationships = pass_report.pass3_relationships;
        report.relationships_ingested += cross_file.len();
        ingestor.ingest_relationships(cross_file).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FakeGraphStore;
    use crate::llm::MockLlmClient;
    use crate::schema::run_migrations;
    use std::fs;

    #[tokio::test]
    async fn run_processes_new_files_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();

        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let llm = Arc::new(MockLlmClient {
            response: r#"{"entities":[{"name":"main","type":"Function","is_exported":true}],"relationships":[]}"#
                .to_string(),
        });
        let store = Arc::new(FakeGraphStore::new());
        let graph: Arc<dyn GraphStore> = store.clone();

        let mut config = Config::default();
        config.project_root = dir.path().to_path_buf();
        config.run_relationship_resolver = true;

        let controller = RunController::new(config, conn, llm, graph);
        let report = controller.run(&dir.path().to_path_buf()).await.unwrap();

        assert_eq!(report.work_items_processed, 1);
        assert_eq!(report.entities_ingested, 1);
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn run_with_empty_directory_produces_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let llm = Arc::new(MockLlmClient {
            response: "{}".to_string(),
        });
        let graph: Arc<dyn GraphStore> = Arc::new(FakeGraphStore::new());
        let mut config = Config::default();
        config.project_root = dir.path().to_path_buf();

        let controller = RunController::new(config, conn, llm, graph);
        let report = controller.run(&dir.path().to_path_buf()).await.unwrap();
        assert_eq!(report.work_items_processed, 0);
    }

    #[tokio::test]
    async fn run_applies_pending_refactoring_task_before_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO files (id, project_id, path, absolute_path, content_hash) \
             VALUES ('f1', ?1, 'old.rs', '/gone/old.rs', 'h1')",
            params![dir
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")],
        )
        .unwrap();
        let project_id = dir
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        conn.execute(
            "INSERT INTO refactoring_tasks (project_id, kind, old_absolute_path) VALUES (?1, 'DELETE', '/gone/old.rs')",
            params![project_id],
        )
        .unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let llm = Arc::new(MockLlmClient {
            response: "{}".to_string(),
        });
        let graph: Arc<dyn GraphStore> = Arc::new(FakeGraphStore::new());
        let mut config = Config::default();
        config.project_root = dir.path().to_path_buf();
        config.project_id = project_id;

        let controller = RunController::new(config, conn, llm, graph);
        let report = controller.run(&dir.path().to_path_buf()).await.unwrap();
        assert_eq!(report.refactor_deletions, 1);
    }
}
