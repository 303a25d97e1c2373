use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline-wide knobs. Defaults match the values named throughout spec §4.
///
/// Loaded from `ARGUS_*` environment variables the way the teacher loads
/// `HERMES_*` ones in `bin/hermes.rs`; anything unset falls back to the
/// documented default.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub db_path: PathBuf,
    pub project_id: String,

    pub worker_pool_size: usize,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub file_size_limit_bytes: u64,
    pub chunk_threshold_bytes: usize,
    pub chunk_size_bytes: usize,
    pub chunk_overlap_lines: usize,
    pub llm_call_timeout: Duration,
    pub reconcile_on_run: bool,
    pub run_relationship_resolver: bool,
}

impl Default for Config {
    fn default() -> Self {
        let project_root = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let db_path = project_root.join(".argus.db");
        let project_id = project_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Self {
            project_root,
            db_path,
            project_id,
            worker_pool_size: 50,
            batch_size: 50,
            queue_capacity: 1000,
            flush_interval: Duration::from_secs(1),
            max_retries: 5,
            file_size_limit_bytes: 1024 * 1024,
            chunk_threshold_bytes: 128 * 1024,
            chunk_size_bytes: 120 * 1024,
            chunk_overlap_lines: 50,
            llm_call_timeout: Duration::from_secs(600),
            reconcile_on_run: false,
            run_relationship_resolver: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(root) = env::var("ARGUS_PROJECT_ROOT") {
            cfg.project_root = PathBuf::from(root);
            cfg.db_path = cfg.project_root.join(".argus.db");
            cfg.project_id = cfg
                .project_root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();
        }
        if let Ok(db) = env::var("ARGUS_DB_PATH") {
            cfg.db_path = PathBuf::from(db);
        }
        if let Ok(id) = env::var("ARGUS_PROJECT_ID") {
            cfg.project_id = id;
        }
        if let Some(v) = env_usize("ARGUS_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = v;
        }
        if let Some(v) = env_usize("ARGUS_BATCH_SIZE") {
            cfg.batch_size = v;
        }
        if let Some(v) = env_usize("ARGUS_QUEUE_CAPACITY") {
            cfg.queue_capacity = v;
        }
        if let Some(v) = env_u64("ARGUS_FLUSH_INTERVAL_SECS") {
            cfg.flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("ARGUS_MAX_RETRIES") {
            cfg.max_retries = v as u32;
        }
        if let Some(v) = env_u64("ARGUS_FILE_SIZE_LIMIT_BYTES") {
            cfg.file_size_limit_bytes = v;
        }
        if let Some(v) = env_u64("ARGUS_LLM_TIMEOUT_SECS") {
            cfg.llm_call_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = env::var("ARGUS_RECONCILE_ON_RUN") {
            cfg.reconcile_on_run = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("ARGUS_RUN_RELATIONSHIP_RESOLVER") {
            cfg.run_relationship_resolver = !(v == "0" || v.eq_ignore_ascii_case("false"));
        }

        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
