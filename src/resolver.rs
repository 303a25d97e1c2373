//! Three-pass relationship resolution (spec §4.5): intra-file, then
//! intra-directory, then global, resolving an entity's short name to a
//! `qualifiedName` with the narrowest-scope match winning. Global first-wins
//! dedup on `(source, target, type)` happens last.
//!
//! Two sources of relationships feed the same scoping tables: the raw
//! relationships a worker's per-file LLM call already extracted (cheap,
//! resolved inline by `resolve`), and the three ordered LLM queries this
//! module issues itself over persisted POIs (`run_three_pass`), the way
//! spec §4.5 describes the resolver discovering relationships the worker's
//! single-file view can't see.

use crate::llm::{parse_and_validate, LlmClient, LlmRequest, RawRelationship};
use crate::models::{EdgeType, Poi, RelationshipRecord};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

const RESOLVER_SYSTEM_PROMPT: &str = "You are analyzing points of interest (POIs) already \
extracted from a codebase to find typed relationships between them. Respond with a single JSON \
object of the shape {\"entities\": [], \"relationships\": [...]} and nothing else. Each \
relationship has a 'source', a 'target', and a 'type' drawn from CONTAINS, CALLS, USES, IMPORTS, \
EXPORTS, EXTENDS. Use the exact identifier given for each POI in the listing below — prefer the \
bracketed qualifiedName when one is shown.";

/// Per-pass relationship counts for the run summary (spec §4.5: "the overall
/// summary reports per-pass counts").
#[derive(Debug, Default, Clone)]
pub struct PassReport {
    pub pass1_relationships: usize,
    pub pass2_relationships: usize,
    pub pass3_relationships: usize,
}

pub struct RelationshipResolver {
    /// `(file_path, short_name) -> qualified_name`, populated per file.
    by_file: HashMap<(String, String), String>,
    /// `(directory, short_name) -> qualified_name`, for cross-file calls
    /// within the same directory.
    by_directory: HashMap<(String, String), String>,
    /// `short_name -> qualified_name`, for exported entities visible
    /// project-wide.
    exported: HashMap<String, String>,
}

impl RelationshipResolver {
    pub fn new() -> Self {
        Self {
            by_file: HashMap::new(),
            by_directory: HashMap::new(),
            exported: HashMap::new(),
        }
    }

    /// Registers one file's entities into all three scopes the resolver
    /// searches, so later calls to `resolve` can find them.
    pub fn register(&mut self, pois: &[Poi]) {
        for poi in pois {
            let dir = directory_of(&poi.file_path);
            self.by_file
                .insert((poi.file_path.clone(), poi.name.clone()), poi.qualified_name.clone());
            self.by_directory
                .entry((dir, poi.name.clone()))
                .or_insert_with(|| poi.qualified_name.clone());
            if poi.is_exported {
                self.exported
                    .entry(poi.name.clone())
                    .or_insert_with(|| poi.qualified_name.clone());
            }
        }
    }

    /// Resolves a raw, file-scoped relationship into a fully qualified
    /// `RelationshipRecord`, or `None` if the target name can't be resolved
    /// in any scope (the relationship is dropped rather than guessed at).
    pub fn resolve(&self, file_path: &str, raw: &RawRelationship) -> Option<RelationshipRecord> {
        let edge_type = EdgeType::try_from(raw.edge_type.as_str()).ok()?;
        let source = self.lookup(file_path, &raw.source)?;
        let target = self.lookup(file_path, &raw.target)?;

        Some(RelationshipRecord {
            source_qualified_name: source,
            target_qualified_name: target,
            edge_type,
            confidence: raw.confidence,
            reason: raw.reason.clone(),
            context: raw.context.clone(),
            line_number: raw.line_number,
        })
    }

    /// Already-qualified names (anything containing `--`, spec glossary) pass
    /// through unchanged; short names are resolved file, then directory,
    /// then project scope, in that order.
    fn lookup(&self, file_path: &str, name: &str) -> Option<String> {
        if name.contains("--") {
            return Some(name.to_string());
        }
        let dir = directory_of(file_path);
        self.by_file
            .get(&(file_path.to_string(), name.to_string()))
            .or_else(|| self.by_directory.get(&(dir, name.to_string())))
            .or_else(|| self.exported.get(name))
            .cloned()
    }

    /// Spec §4.5: three strictly ordered LLM queries over the POIs already
    /// persisted for this run. Pass 1 asks about relationships within a
    /// single file; pass 2 about cross-file relationships within a
    /// directory; pass 3 about long-range relationships between exported
    /// POIs anywhere in the project. A pass whose LLM call or parse fails
    /// contributes an empty set and the run continues — never aborts.
    /// Cross-pass dedup is first-wins on `(source, target, type)`.
    pub async fn run_three_pass(
        &self,
        llm: &dyn LlmClient,
        pois_by_file: &[(String, Vec<Poi>)],
    ) -> (Vec<RelationshipRecord>, PassReport) {
        let mut report = PassReport::default();
        let mut all = Vec::new();

        for (file_path, pois) in pois_by_file {
            if pois.len() < 2 {
                continue;
            }
            let found = self
                .query_pass(llm, intra_file_prompt(file_path, pois), file_path)
                .await;
            report.pass1_relationships += found.len();
            all.extend(found);
        }

        let by_dir = group_by_directory(pois_by_file);
        for (dir, files) in &by_dir {
            let found = self
                .query_pass(llm, intra_directory_prompt(dir, files), dir)
                .await;
            report.pass2_relationships += found.len();
            all.extend(found);
        }

        let exported_by_dir = group_exported_by_directory(pois_by_file);
        if !exported_by_dir.is_empty() {
            let found = self
                .query_pass(llm, global_prompt(&exported_by_dir), "project")
                .await;
            report.pass3_relationships += found.len();
            all.extend(found);
        }

        (Self::dedup(all), report)
    }

    async fn query_pass(&self, llm: &dyn LlmClient, prompt: String, scope_hint: &str) -> Vec<RelationshipRecord> {
        let request = LlmRequest {
            system: RESOLVER_SYSTEM_PROMPT.to_string(),
            user: prompt,
        };

        let response = match llm.call(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, scope = scope_hint, "relationship resolver pass failed, yielding empty set");
                return Vec::new();
            }
        };

        let payload = match parse_and_validate(&response.body) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, scope = scope_hint, "relationship resolver pass produced unparsable output");
                return Vec::new();
            }
        };

        payload
            .relationships
            .iter()
            .filter_map(|r| self.resolve(scope_hint, r))
            .collect()
    }

    /// Applies global first-wins dedup on `(source, target, type)` across the
    /// whole resolved set (spec §4.5).
    pub fn dedup(records: Vec<RelationshipRecord>) -> Vec<RelationshipRecord> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let key = (
                record.source_qualified_name.clone(),
                record.target_qualified_name.clone(),
                record.edge_type.as_str(),
            );
            if seen.insert(key) {
                out.push(record);
            }
        }
        out
    }
}

impl Default for RelationshipResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn directory_of(file_path: &str) -> String {
    Path::new(file_path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn intra_file_prompt(file_path: &str, pois: &[Poi]) -> String {
    let listing: String = pois
        .iter()
        .map(|p| format!("- {} ({})", p.name, p.node_type))
        .collect::<Vec<_>>()
        .join("\n");
    format!("File: {file_path}\nPOIs defined in this file:\n{listing}\n\nIdentify relationships among these POIs.")
}

fn intra_directory_prompt(dir: &str, files: &[&(String, Vec<Poi>)]) -> String {
    let mut listing = String::new();
    for (file_path, pois) in files {
        listing.push_str(&format!("File: {file_path}\n"));
        for p in pois {
            listing.push_str(&format!("  - {} ({}) [{}]\n", p.name, p.node_type, p.qualified_name));
        }
    }
    format!(
        "Directory: {dir}\nPOIs grouped by file (referenced by the bracketed qualifiedName):\n{listing}\n\
Focus on cross-file imports and calls."
    )
}

fn global_prompt(exported_by_dir: &[(String, Vec<Poi>)]) -> String {
    let mut listing = String::new();
    for (dir, pois) in exported_by_dir {
        listing.push_str(&format!("Directory: {dir}\n"));
        for p in pois {
            listing.push_str(&format!("  - {} ({}) [{}]\n", p.name, p.node_type, p.qualified_name));
        }
    }
    format!(
        "Exported POIs across the project, grouped by directory (referenced by qualifiedName):\n{listing}\n\
Identify long-range relationships (e.g. a route referencing a service)."
    )
}

fn group_by_directory(pois_by_file: &[(String, Vec<Poi>)]) -> Vec<(String, Vec<&(String, Vec<Poi>)>)> {
    let mut map: HashMap<String, Vec<&(String, Vec<Poi>)>> = HashMap::new();
    let mut order = Vec::new();
    for entry in pois_by_file {
        let dir = directory_of(&entry.0);
        if !map.contains_key(&dir) {
            order.push(dir.clone());
        }
        map.entry(dir).or_default().push(entry);
    }
    order
        .into_iter()
        .map(|d| {
            let v = map.remove(&d).unwrap_or_default();
            (d, v)
        })
        .collect()
}

fn group_exported_by_directory(pois_by_file: &[(String, Vec<Poi>)]) -> Vec<(String, Vec<Poi>)> {
    let mut map: HashMap<String, Vec<Poi>> = HashMap::new();
    let mut order = Vec::new();
    for (file_path, pois) in pois_by_file {
        for poi in pois {
            if poi.is_exported {
                let dir = directory_of(file_path);
                if !map.contains_key(&dir) {
                    order.push(dir.clone());
                }
                map.entry(dir).or_default().push(poi.clone());
            }
        }
    }
    order
        .into_iter()
        .map(|d| {
            let v = map.remove(&d).unwrap_or_default();
            (d, v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::models::NodeType;

    fn poi(file: &str, name: &str, exported: bool) -> Poi {
        Poi {
            qualified_name: Poi::qualified_name_for(NodeType::Function, file, name),
            name: name.to_string(),
            node_type: NodeType::Function,
            file_path: file.to_string(),
            start_line: Some(1),
            end_line: Some(2),
            is_exported: exported,
            signature: None,
        }
    }

    fn raw(source: &str, target: &str, edge: &str) -> RawRelationship {
        RawRelationship {
            source: source.to_string(),
            target: target.to_string(),
            edge_type: edge.to_string(),
            confidence: 1.0,
            reason: None,
            context: None,
            line_number: None,
        }
    }

    #[test]
    fn resolves_within_same_file_first() {
        let mut resolver = RelationshipResolver::new();
        resolver.register(&[poi("/repo/a.rs", "helper", false)]);
        let rec = resolver.resolve("/repo/a.rs", &raw("main", "helper", "CALLS")).unwrap();
        assert_eq!(rec.target_qualified_name, "/repo/a.rs--helper");
    }

    #[test]
    fn resolves_across_directory_when_not_in_same_file() {
        let mut resolver = RelationshipResolver::new();
        resolver.register(&[poi("/repo/util.rs", "helper", false)]);
        let rec = resolver.resolve("/repo/a.rs", &raw("main", "helper", "CALLS")).unwrap();
        assert_eq!(rec.target_qualified_name, "/repo/util.rs--helper");
    }

    #[test]
    fn resolves_via_exported_scope_across_directories() {
        let mut resolver = RelationshipResolver::new();
        resolver.register(&[poi("/repo/lib/util.rs", "helper", true)]);
        let rec = resolver
            .resolve("/repo/app/main.rs", &raw("main", "helper", "CALLS"))
            .unwrap();
        assert_eq!(rec.target_qualified_name, "/repo/lib/util.rs--helper");
    }

    #[test]
    fn unresolvable_name_drops_the_relationship() {
        let resolver = RelationshipResolver::new();
        assert!(resolver.resolve("/repo/a.rs", &raw("main", "ghost", "CALLS")).is_none());
    }

    #[test]
    fn already_qualified_names_pass_through() {
        let resolver = RelationshipResolver::new();
        let rec = resolver
            .resolve("/repo/a.rs", &raw("/repo/a.rs--main", "/repo/b.rs--helper", "CALLS"))
            .unwrap();
        assert_eq!(rec.source_qualified_name, "/repo/a.rs--main");
    }

    #[test]
    fn dedup_keeps_first_occurrence_only() {
        let mut resolver = RelationshipResolver::new();
        resolver.register(&[poi("/repo/a.rs", "helper", false)]);
        let r1 = resolver.resolve("/repo/a.rs", &raw("main", "helper", "CALLS")).unwrap();
        let mut r2 = resolver.resolve("/repo/a.rs", &raw("main", "helper", "CALLS")).unwrap();
        r2.confidence = 0.1;
        let deduped = RelationshipResolver::dedup(vec![r1.clone(), r2]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].confidence, r1.confidence);
    }

    #[tokio::test]
    async fn three_pass_skips_intra_file_for_single_poi_files() {
        let mut resolver = RelationshipResolver::new();
        let pois = vec![poi("/repo/a.rs", "main", false)];
        resolver.register(&pois);
        let llm = MockLlmClient {
            response: r#"{"entities":[],"relationships":[]}"#.to_string(),
        };
        let pois_by_file = vec![("/repo/a.rs".to_string(), pois)];
        let (relationships, report) = resolver.run_three_pass(&llm, &pois_by_file).await;
        assert_eq!(report.pass1_relationships, 0);
        assert!(relationships.is_empty());
    }

    #[tokio::test]
    async fn three_pass_runs_intra_file_for_multi_poi_files() {
        let mut resolver = RelationshipResolver::new();
        let pois = vec![poi("/repo/a.rs", "main", false), poi("/repo/a.rs", "helper", false)];
        resolver.register(&pois);
        let llm = MockLlmClient {
            response: r#"{"entities":[],"relationships":[{"source":"main","target":"helper","type":"CALLS"}]}"#
                .to_string(),
        };
        let pois_by_file = vec![("/repo/a.rs".to_string(), pois)];
        let (relationships, report) = resolver.run_three_pass(&llm, &pois_by_file).await;
        assert_eq!(report.pass1_relationships, 1);
        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0].target_qualified_name, "/repo/a.rs--helper");
    }

    #[tokio::test]
    async fn three_pass_global_skipped_when_nothing_exported() {
        let mut resolver = RelationshipResolver::new();
        let pois = vec![poi("/repo/a.rs", "main", false)];
        resolver.register(&pois);
        let llm = MockLlmClient {
            response: r#"{"entities":[],"relationships":[{"source":"x","target":"y","type":"CALLS"}]}"#.to_string(),
        };
        let pois_by_file = vec![("/repo/a.rs".to_string(), pois)];
        let (_relationships, report) = resolver.run_three_pass(&llm, &pois_by_file).await;
        assert_eq!(report.pass3_relationships, 0);
    }

    #[tokio::test]
    async fn three_pass_failed_llm_call_yields_empty_set_not_error() {
        struct FailingLlm;
        #[async_trait::async_trait]
        impl LlmClient for FailingLlm {
            async fn call(&self, _request: LlmRequest) -> Result<crate::llm::LlmResponse, crate::error::IngestError> {
                Err(crate::error::IngestError::LlmCallFailed("boom".to_string()))
            }
        }
        let mut resolver = RelationshipResolver::new();
        let pois = vec![poi("/repo/a.rs", "main", false), poi("/repo/a.rs", "helper", false)];
        resolver.register(&pois);
        let pois_by_file = vec![("/repo/a.rs".to_string(), pois)];
        let (relationships, report) = resolver.run_three_pass(&FailingLlm, &pois_by_file).await;
        assert!(relationships.is_empty());
        assert_eq!(report.pass1_relationships, 0);
    }
}
