use anyhow::Result;
use rusqlite::Connection;

/// Relational DDL (spec §3.1). Run under WAL mode with `foreign_keys=ON`
/// the way `HermesEngine::new` configures its connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    Ok(())
}

const CREATE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS files (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL,
    path          TEXT NOT NULL,
    absolute_path TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    language      TEXT,
    size          INTEGER NOT NULL DEFAULT 0,
    special_type  TEXT,
    status        TEXT NOT NULL DEFAULT 'pending',
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at    TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(project_id, path)
);

CREATE INDEX IF NOT EXISTS idx_files_project ON files(project_id);
CREATE INDEX IF NOT EXISTS idx_files_status ON files(project_id, status);

CREATE TABLE IF NOT EXISTS file_state (
    project_id    TEXT NOT NULL,
    path          TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    last_scanned  TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (project_id, path)
);

CREATE INDEX IF NOT EXISTS idx_file_state_path ON file_state(path);

CREATE TABLE IF NOT EXISTS work_queue (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id      TEXT NOT NULL,
    file_id         TEXT NOT NULL,
    file_path       TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    project_context TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    worker_id       TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    started_at      TEXT,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_work_queue_status ON work_queue(status);
CREATE INDEX IF NOT EXISTS idx_work_queue_project ON work_queue(project_id, status);

CREATE TABLE IF NOT EXISTS analysis_results (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id              TEXT NOT NULL,
    work_item_id            INTEGER NOT NULL,
    file_path               TEXT NOT NULL,
    absolute_file_path      TEXT NOT NULL,
    llm_output              TEXT NOT NULL,
    status                  TEXT NOT NULL DEFAULT 'pending_ingestion',
    validation_passed       INTEGER NOT NULL DEFAULT 1,
    entities_count          INTEGER NOT NULL DEFAULT 0,
    relationships_count     INTEGER NOT NULL DEFAULT 0,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    processing_duration_ms  INTEGER NOT NULL DEFAULT 0,
    created_at              TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at              TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_analysis_results_status ON analysis_results(status);
CREATE INDEX IF NOT EXISTS idx_analysis_results_project ON analysis_results(project_id, status);

CREATE TABLE IF NOT EXISTS failed_work (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id    TEXT NOT NULL,
    work_item_id  INTEGER NOT NULL,
    error_message TEXT NOT NULL,
    error_type    TEXT NOT NULL,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    last_retry_at TEXT,
    created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_failed_work_project ON failed_work(project_id);

CREATE TABLE IF NOT EXISTS refactoring_tasks (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id         TEXT NOT NULL,
    kind               TEXT NOT NULL,
    old_absolute_path  TEXT NOT NULL,
    new_absolute_path  TEXT,
    status             TEXT NOT NULL DEFAULT 'pending',
    created_at         TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_refactoring_tasks_status ON refactoring_tasks(project_id, status);
";
