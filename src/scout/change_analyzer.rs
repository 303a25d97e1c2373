//! Diffs a fresh directory walk against the previous `file_state` snapshot
//! and classifies each path as new, modified, unchanged, deleted, or renamed
//! (spec §4.1, steps 3-4).

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: String,
    pub absolute_path: String,
    pub content_hash: String,
    pub language: Option<String>,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    New(ScannedFile),
    Modified(ScannedFile),
    /// Same path, same hash as last scan: no work item emitted.
    Unchanged,
    Deleted { path: String },
    /// A deleted path and a new path share a content hash: surfaced as a
    /// rename rather than a delete+add pair (spec §4.1 step 4).
    Renamed { old_path: String, new_path: String },
}

pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new_files(&self) -> impl Iterator<Item = &ScannedFile> {
        self.changes.iter().filter_map(|c| match c {
            Change::New(f) => Some(f),
            _ => None,
        })
    }

    pub fn modified_files(&self) -> impl Iterator<Item = &ScannedFile> {
        self.changes.iter().filter_map(|c| match c {
            Change::Modified(f) => Some(f),
            _ => None,
        })
    }

    pub fn deleted_paths(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| match c {
            Change::Deleted { path } => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn renames(&self) -> impl Iterator<Item = (&str, &str)> {
        self.changes.iter().filter_map(|c| match c {
            Change::Renamed { old_path, new_path } => Some((old_path.as_str(), new_path.as_str())),
            _ => None,
        })
    }
}

/// `previous`: `path -> content_hash` from the last `file_state` snapshot.
pub fn analyze(current: &[ScannedFile], previous: &HashMap<String, String>) -> ChangeSet {
    let mut seen_paths: HashMap<&str, &ScannedFile> = HashMap::new();
    for f in current {
        seen_paths.insert(f.path.as_str(), f);
    }

    let mut changes = Vec::new();
    let mut new_candidates = Vec::new();
    let mut deleted_candidates = Vec::new();

    for f in current {
        match previous.get(&f.path) {
            None => new_candidates.push(f.clone()),
            Some(prev_hash) if *prev_hash == f.content_hash => changes.push(Change::Unchanged),
            Some(_) => changes.push(Change::Modified(f.clone())),
        }
    }

    for path in previous.keys() {
        if !seen_paths.contains_key(path.as_str()) {
            deleted_candidates.push(path.clone());
        }
    }

    // Rename detection: a deleted path whose hash exactly matches a new
    // path's hash is a rename, not an independent delete+add.
    let mut matched_new: Vec<bool> = vec![false; new_candidates.len()];
    let mut remaining_deleted = Vec::new();

    for old_path in deleted_candidates {
        let old_hash = previous.get(&old_path).cloned().unwrap_or_default();
        let hit = new_candidates
            .iter()
            .enumerate()
            .find(|(i, f)| !matched_new[*i] && f.content_hash == old_hash);

        match hit {
            Some((i, f)) => {
                matched_new[i] = true;
                changes.push(Change::Renamed {
                    old_path,
                    new_path: f.path.clone(),
                });
            }
            None => remaining_deleted.push(old_path),
        }
    }

    for path in remaining_deleted {
        changes.push(Change::Deleted { path });
    }

    for (i, f) in new_candidates.into_iter().enumerate() {
        if !matched_new[i] {
            changes.push(Change::New(f));
        }
    }

    ChangeSet { changes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, hash: &str) -> ScannedFile {
        ScannedFile {
            path: path.to_string(),
            absolute_path: format!("/repo/{path}"),
            content_hash: hash.to_string(),
            language: Some("rs".to_string()),
            size: 10,
        }
    }

    #[test]
    fn detects_new_file() {
        let current = vec![file("a.rs", "h1")];
        let previous = HashMap::new();
        let set = analyze(&current, &previous);
        assert_eq!(set.new_files().count(), 1);
    }

    #[test]
    fn detects_unchanged_file() {
        let current = vec![file("a.rs", "h1")];
        let mut previous = HashMap::new();
        previous.insert("a.rs".to_string(), "h1".to_string());
        let set = analyze(&current, &previous);
        assert!(set.changes.iter().all(|c| matches!(c, Change::Unchanged)));
    }

    #[test]
    fn detects_modified_file() {
        let current = vec![file("a.rs", "h2")];
        let mut previous = HashMap::new();
        previous.insert("a.rs".to_string(), "h1".to_string());
        let set = analyze(&current, &previous);
        assert_eq!(set.modified_files().count(), 1);
    }

    #[test]
    fn detects_deleted_file() {
        let current = vec![];
        let mut previous = HashMap::new();
        previous.insert("a.rs".to_string(), "h1".to_string());
        let set = analyze(&current, &previous);
        assert_eq!(set.deleted_paths().collect::<Vec<_>>(), vec!["a.rs"]);
    }

    #[test]
    fn detects_rename_via_matching_hash() {
        let current = vec![file("b.rs", "h1")];
        let mut previous = HashMap::new();
        previous.insert("a.rs".to_string(), "h1".to_string());
        let set = analyze(&current, &previous);
        let renames: Vec<_> = set.renames().collect();
        assert_eq!(renames, vec![("a.rs", "b.rs")]);
        assert_eq!(set.new_files().count(), 0);
        assert_eq!(set.deleted_paths().count(), 0);
    }

    #[test]
    fn distinct_delete_and_add_not_conflated_when_hashes_differ() {
        let current = vec![file("b.rs", "h2")];
        let mut previous = HashMap::new();
        previous.insert("a.rs".to_string(), "h1".to_string());
        let set = analyze(&current, &previous);
        assert_eq!(set.new_files().count(), 1);
        assert_eq!(set.deleted_paths().count(), 1);
        assert_eq!(set.renames().count(), 0);
    }
}
