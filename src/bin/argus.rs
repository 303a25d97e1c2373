use anyhow::Result;
use argus_ingest::config::Config;
use argus_ingest::graph::{FakeGraphStore, GraphStore, Neo4jGraphStore};
use argus_ingest::llm::{HttpLlmClient, LlmClient};
use argus_ingest::IngestEngine;
use clap::{Parser, Subcommand};
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "argus", about = "Code-knowledge-graph ingestion pipeline", arg_required_else_help = true, after_help = "\
Environment variables:
  ARGUS_PROJECT_ROOT          Root directory to index (default: cwd)
  ARGUS_DB_PATH                SQLite DB path (default: <project_root>/.argus.db)
  ARGUS_PROJECT_ID             Project identifier (default: root dir name)
  ARGUS_LLM_API_KEY            API key for the analysis LLM (required unless --dry-run)
  ARGUS_NEO4J_URI               Bolt URI (default: bolt://localhost:7687)
  ARGUS_NEO4J_USER               Neo4j user (default: neo4j)
  ARGUS_NEO4J_PASSWORD            Neo4j password")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use an in-memory fake graph store instead of connecting to Neo4j
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the project, process pending work, and ingest into the graph
    Run,

    /// Run only the self-cleaning reconciler
    Reconcile,

    /// Print the resolved configuration and exit
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Status => {
            let output = serde_json::json!({
                "project_root": config.project_root,
                "db_path": config.db_path,
                "project_id": config.project_id,
                "worker_pool_size": config.worker_pool_size,
                "batch_size": config.batch_size,
                "reconcile_on_run": config.reconcile_on_run,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Run => {
            let target = config.project_root.clone();
            let engine = build_engine(config, cli.dry_run).await?;
            let report = engine.run(&target).await?;
            println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            Ok(())
        }
        Commands::Reconcile => {
            let engine = build_engine(config, cli.dry_run).await?;
            let report = engine.reconcile().await?;
            let output = serde_json::json!({
                "marked_for_deletion": report.marked_for_deletion,
                "deletions_applied": report.deletions_applied,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

async fn build_engine(config: Config, dry_run: bool) -> Result<IngestEngine> {
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm_call_timeout)?);
    let graph: Arc<dyn GraphStore> = if dry_run {
        Arc::new(FakeGraphStore::new())
    } else {
        let uri = env::var("ARGUS_NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".to_string());
        let user = env::var("ARGUS_NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
        let password = env::var("ARGUS_NEO4J_PASSWORD").unwrap_or_default();
        Arc::new(Neo4jGraphStore::connect(&uri, &user, &password).await?)
    };
    Ok(IngestEngine::new(config, llm, graph)?)
}

fn report_json(report: &argus_ingest::run_controller::RunReport) -> serde_json::Value {
    serde_json::json!({
        "scan": report.scan.as_ref().map(|s| serde_json::json!({
            "new_files": s.new_files,
            "modified_files": s.modified_files,
            "deleted_files": s.deleted_files,
            "renamed_files": s.renamed_files,
            "unchanged_files": s.unchanged_files,
            "work_items_enqueued": s.work_items_enqueued,
        })),
        "work_items_processed": report.work_items_processed,
        "work_items_failed": report.work_items_failed,
        "entities_ingested": report.entities_ingested,
        "relationships_ingested": report.relationships_ingested,
        "refactor_deletions": report.refactor_deletions,
        "refactor_renames": report.refactor_renames,
        "reconcile_marked": report.reconcile_marked,
        "reconcile_deletions": report.reconcile_deletions,
        "resolver_pass1_relationships": report.resolver_pass1_relationships,
        "resolver_pass2_relationships": report.resolver_pass2_relationships,
        "resolver_pass3_relationships": report.resolver_pass3_relationships,
    })
}
