//! Discovery, hashing, and change detection (spec §4.1).
//!
//! Mirrors the teacher's `ingestion` module shape: a parallel, CPU-bound
//! walk-and-hash phase (via `rayon`, as `ingestion/mod.rs` uses `par_iter`
//! over files) followed by a single transactional write through the shared
//! `Arc<Mutex<Connection>>`.

pub mod change_analyzer;
pub mod hasher;

use crate::error::IngestError;
use crate::models::{FileStatus, RefactoringKind};
use change_analyzer::{analyze, Change, ScannedFile};
use rayon::prelude::*;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub new_files: usize,
    pub modified_files: usize,
    pub deleted_files: usize,
    pub renamed_files: usize,
    pub unchanged_files: usize,
    pub work_items_enqueued: usize,
}

pub struct Scout {
    conn: Arc<Mutex<Connection>>,
    project_id: String,
}

impl Scout {
    pub fn new(conn: Arc<Mutex<Connection>>, project_id: impl Into<String>) -> Self {
        Self {
            conn,
            project_id: project_id.into(),
        }
    }

    /// Runs one full discovery pass over `root`: walk, hash (in parallel),
    /// diff against the previous snapshot, and commit everything the
    /// downstream pipeline needs in one transaction.
    pub fn scan(&self, root: &Path) -> Result<ScanReport, IngestError> {
        let discovered =
            hasher::discover(root).map_err(|e| IngestError::ReadError(e.to_string()))?;
        info!(count = discovered.len(), "scout discovered candidate files");

        let scanned: Vec<ScannedFile> = discovered
            .par_iter()
            .filter_map(|path| match hasher::hash_file(path) {
                Ok(content_hash) => {
                    let rel = relative_to(root, path);
                    Some(ScannedFile {
                        path: rel,
                        absolute_path: path.to_string_lossy().to_string(),
                        content_hash,
                        language: hasher::language_for(path),
                        size: std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0),
                    })
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to hash file, skipping");
                    None
                }
            })
            .collect();

        let previous = self.load_previous_state()?;
        let change_set = analyze(&scanned, &previous);

        self.apply(&change_set, &scanned)
    }

    fn load_previous_state(&self) -> Result<HashMap<String, String>, IngestError> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT path, content_hash FROM file_state WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (path, hash) = row?;
            map.insert(path, hash);
        }
        Ok(map)
    }

    fn apply(
        &self,
        change_set: &change_analyzer::ChangeSet,
        scanned: &[ScannedFile],
    ) -> Result<ScanReport, IngestError> {
        let mut report = ScanReport::default();
        let mut conn = self.conn.lock().expect("db mutex poisoned");
        let tx = conn.transaction()?;

        for f in change_set.new_files() {
            let file_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO files (id, project_id, path, absolute_path, content_hash, language, size, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(project_id, path) DO UPDATE SET
                   content_hash = excluded.content_hash,
                   absolute_path = excluded.absolute_path,
                   language = excluded.language,
                   size = excluded.size,
                   status = excluded.status,
                   updated_at = datetime('now')",
                params![
                    file_id,
                    self.project_id,
                    f.path,
                    f.absolute_path,
                    f.content_hash,
                    f.language,
                    f.size,
                    FileStatus::Pending.as_str(),
                ],
            )?;
            enqueue_work_item(&tx, &self.project_id, &file_id, f)?;
            report.new_files += 1;
            report.work_items_enqueued += 1;
        }

        for f in change_set.modified_files() {
            let file_id: String = tx
                .query_row(
                    "SELECT id FROM files WHERE project_id = ?1 AND path = ?2",
                    params![self.project_id, f.path],
                    |row| row.get(0),
                )
                .unwrap_or_else(|_| Uuid::new_v4().to_string());

            tx.execute(
                "INSERT INTO files (id, project_id, path, absolute_path, content_hash, language, size, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(project_id, path) DO UPDATE SET
                   content_hash = excluded.content_hash,
                   absolute_path = excluded.absolute_path,
                   language = excluded.language,
                   size = excluded.size,
                   status = excluded.status,
                   updated_at = datetime('now')",
                params![
                    file_id,
                    self.project_id,
                    f.path,
                    f.absolute_path,
                    f.content_hash,
                    f.language,
                    f.size,
                    FileStatus::Pending.as_str(),
                ],
            )?;
            enqueue_work_item(&tx, &self.project_id, &file_id, f)?;
            report.modified_files += 1;
            report.work_items_enqueued += 1;
        }

        for (old_path, new_path) in change_set.renames() {
            tx.execute(
                "INSERT INTO refactoring_tasks (project_id, kind, old_absolute_path, new_absolute_path)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.project_id,
                    RefactoringKind::Rename.as_str(),
                    old_path,
                    new_path,
                ],
            )?;
            tx.execute(
                "UPDATE files SET path = ?1, updated_at = datetime('now') WHERE project_id = ?2 AND path = ?3",
                params![new_path, self.project_id, old_path],
            )?;
            report.renamed_files += 1;
        }

        for path in change_set.deleted_paths() {
            let absolute_path: Option<String> = tx
                .query_row(
                    "SELECT absolute_path FROM files WHERE project_id = ?1 AND path = ?2",
                    params![self.project_id, path],
                    |row| row.get(0),
                )
                .ok();

            if let Some(absolute_path) = absolute_path {
                tx.execute(
                    "INSERT INTO refactoring_tasks (project_id, kind, old_absolute_path)
                     VALUES (?1, ?2, ?3)",
                    params![self.project_id, RefactoringKind::Delete.as_str(), absolute_path],
                )?;
            }
            tx.execute(
                "UPDATE files SET status = ?1, updated_at = datetime('now') WHERE project_id = ?2 AND path = ?3",
                params![FileStatus::PendingDeletion.as_str(), self.project_id, path],
            )?;
            report.deleted_files += 1;
        }

        report.unchanged_files = change_set
            .changes
            .iter()
            .filter(|c| matches!(c, Change::Unchanged))
            .count();

        // Wholesale replace of this project's file_state snapshot: the
        // baseline for the *next* scan is every file we observed this run,
        // not just the New/Modified subset of `change_set` — `Unchanged`
        // carries no `ScannedFile` payload, so rebuilding from `change_set`
        // alone would drop unchanged files from the snapshot and make the
        // next scan misclassify them as new.
        tx.execute(
            "DELETE FROM file_state WHERE project_id = ?1",
            params![self.project_id],
        )?;
        for f in scanned {
            tx.execute(
                "INSERT INTO file_state (project_id, path, content_hash) VALUES (?1, ?2, ?3)",
                params![self.project_id, f.path, f.content_hash],
            )?;
        }

        tx.commit()?;
        debug!(?report, "scout scan committed");
        Ok(report)
    }
}

fn enqueue_work_item(
    tx: &rusqlite::Transaction,
    project_id: &str,
    file_id: &str,
    f: &ScannedFile,
) -> Result<(), IngestError> {
    tx.execute(
        "INSERT INTO work_queue (project_id, file_id, file_path, content_hash, status)
         VALUES (?1, ?2, ?3, ?4, 'pending')",
        params![project_id, file_id, f.absolute_path, f.content_hash],
    )?;
    Ok(())
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
