pub mod batch;
pub mod config;
pub mod error;
pub mod graph;
pub mod llm;
pub mod models;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod run_controller;
pub mod schema;
pub mod scout;
pub mod worker;

use anyhow::{Context, Result};
use config::Config;
use graph::GraphStore;
use llm::LlmClient;
use run_controller::{RunController, RunReport};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tracing::info;

/// Composition root: owns the relational connection and wires Scout, the
/// work queue, the worker fleet, the relationship resolver, the graph
/// ingestor, and the reconciler into one `RunController` (spec §4.8).
#[derive(Clone)]
pub struct IngestEngine {
    config: Config,
    conn: Arc<StdMutex<Connection>>,
    llm: Arc<dyn LlmClient>,
    graph: Arc<dyn GraphStore>,
}

impl IngestEngine {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>, graph: Arc<dyn GraphStore>) -> Result<Self> {
        let conn = Connection::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        schema::run_migrations(&conn)?;
        info!(db_path = %config.db_path.display(), "ingest engine opened relational store");

        Ok(Self {
            config,
            conn: Arc::new(StdMutex::new(conn)),
            llm,
            graph,
        })
    }

    pub fn in_memory(config: Config, llm: Arc<dyn LlmClient>, graph: Arc<dyn GraphStore>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            config,
            conn: Arc::new(StdMutex::new(conn)),
            llm,
            graph,
        })
    }

    pub fn db(&self) -> &Arc<StdMutex<Connection>> {
        &self.conn
    }

    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    /// Runs one full pass: discover, process, resolve, ingest, and
    /// (if configured) reconcile, over `target_dir`.
    pub async fn run(&self, target_dir: &Path) -> Result<RunReport, error::IngestError> {
        let controller = RunController::new(
            self.config.clone(),
            self.conn.clone(),
            self.llm.clone(),
            self.graph.clone(),
        );
        controller.run(&target_dir.to_path_buf()).await
    }

    /// Runs only the self-cleaning reconciler, independent of a full scan.
    pub async fn reconcile(&self) -> Result<reconciler::ReconcileReport, error::IngestError> {
        let reconciler = reconciler::SelfCleaningReconciler::new(self.graph.clone(), self.conn.clone());
        reconciler.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph::FakeGraphStore;
    use llm::MockLlmClient;

    #[tokio::test]
    async fn in_memory_engine_runs_against_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.project_root = dir.path().to_path_buf();
        config.project_id = "test-project".to_string();

        let llm = Arc::new(MockLlmClient {
            response: "{}".to_string(),
        });
        let graph: Arc<dyn GraphStore> = Arc::new(FakeGraphStore::new());
        let engine = IngestEngine::in_memory(config, llm, graph).unwrap();
        assert_eq!(engine.project_id(), "test-project");

        let report = engine.run(dir.path()).await.unwrap();
        assert_eq!(report.work_items_processed, 0);
    }
}
