//! Graph store adapter (spec §4.6, §6.2): a `GraphStore` trait behind which
//! the production Neo4j-speaking adapter and an in-memory test double both
//! live, the same way `KnowledgeGraph` wraps `Arc<Mutex<Connection>>` so
//! callers never touch a driver directly.

pub mod ingestor;

use crate::error::IngestError;
use crate::models::{EdgeType, NodeType, Poi, RelationshipRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// One commit's worth of graph writes (spec §4.6): nodes to MERGE,
/// relationships to MERGE, and nodes/relationships to delete for
/// already-resolved refactoring tasks.
#[derive(Debug, Clone, Default)]
pub struct GraphBatch {
    pub upsert_nodes: Vec<Poi>,
    pub upsert_relationships: Vec<RelationshipRecord>,
    pub delete_qualified_names: Vec<String>,
}

impl GraphBatch {
    pub fn is_empty(&self) -> bool {
        self.upsert_nodes.is_empty()
            && self.upsert_relationships.is_empty()
            && self.delete_qualified_names.is_empty()
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Applies one batch as a single unit: all nodes and relationships MERGE
    /// in one round trip, or none do (spec Inv. — partial commits are never
    /// observable downstream).
    async fn apply_batch(&self, batch: &GraphBatch) -> Result<(), IngestError>;

    /// Deletes every node whose `qualifiedName` matches, cascading to
    /// incident relationships, used by the reconciler's graph-first sweep.
    async fn delete_nodes(&self, qualified_names: &[String]) -> Result<(), IngestError>;

    /// Every node qualifiedName currently under `path_prefix`, used by the
    /// reconciler to find graph-side orphans.
    async fn list_qualified_names_under(&self, path_prefix: &str) -> Result<Vec<String>, IngestError>;

    /// Rewrites `filePath` and `qualifiedName` in place for every node under
    /// `old_path`, string-replacing `old_path` with `new_path` (spec §4.6
    /// RENAME handling). Node identity and incident relationships are
    /// preserved; nothing is deleted or recreated.
    async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<(), IngestError>;
}

/// Speaks Bolt/Cypher to a real Neo4j-compatible server. No pack example
/// uses a graph-database driver directly; `neo4rs` is the idiomatic choice
/// among maintained async Neo4j clients for a tokio-based service like this
/// one (see DESIGN.md).
pub struct Neo4jGraphStore {
    graph: neo4rs::Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, IngestError> {
        let graph = neo4rs::Graph::new(uri, user, password)
            .await
            .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;
        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn apply_batch(&self, batch: &GraphBatch) -> Result<(), IngestError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut txn = self
            .graph
            .start_txn()
            .await
            .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;

        for poi in &batch.upsert_nodes {
            let label = poi.node_type.as_str();
            let query = neo4rs::query(&format!(
                "MERGE (n:{label} {{qualifiedName: $qn}}) \
                 SET n.name = $name, n.filePath = $file_path, n.startLine = $start_line, \
                     n.endLine = $end_line, n.isExported = $is_exported, n.signature = $signature"
            ))
            .param("qn", poi.qualified_name.clone())
            .param("name", poi.name.clone())
            .param("file_path", poi.file_path.clone())
            .param("start_line", poi.start_line.unwrap_or(-1))
            .param("end_line", poi.end_line.unwrap_or(-1))
            .param("is_exported", poi.is_exported)
            .param("signature", poi.signature.clone().unwrap_or_default());

            txn.run(query)
                .await
                .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;
        }

        for rel in &batch.upsert_relationships {
            let edge = rel.edge_type.as_str();
            let query = neo4rs::query(&format!(
                "MATCH (s {{qualifiedName: $source}}), (t {{qualifiedName: $target}}) \
                 MERGE (s)-[r:{edge}]->(t) \
                 SET r.confidence = $confidence, r.reason = $reason, r.context = $context, \
                     r.lineNumber = $line_number"
            ))
            .param("source", rel.source_qualified_name.clone())
            .param("target", rel.target_qualified_name.clone())
            .param("confidence", rel.confidence)
            .param("reason", rel.reason.clone().unwrap_or_default())
            .param("context", rel.context.clone().unwrap_or_default())
            .param("line_number", rel.line_number.unwrap_or(-1));

            txn.run(query)
                .await
                .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;
        }

        for qn in &batch.delete_qualified_names {
            let query = neo4rs::query("MATCH (n {qualifiedName: $qn}) DETACH DELETE n").param("qn", qn.clone());
            txn.run(query)
                .await
                .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;
        }

        txn.commit()
            .await
            .map_err(|e| IngestError::GraphCommitError(e.to_string()))
    }

    async fn delete_nodes(&self, qualified_names: &[String]) -> Result<(), IngestError> {
        for qn in qualified_names {
            let query = neo4rs::query("MATCH (n {qualifiedName: $qn}) DETACH DELETE n").param("qn", qn.clone());
            self.graph
                .run(query)
                .await
                .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;
        }
        Ok(())
    }

    async fn list_qualified_names_under(&self, path_prefix: &str) -> Result<Vec<String>, IngestError> {
        let mut result = self
            .graph
            .execute(
                neo4rs::query("MATCH (n) WHERE n.filePath STARTS WITH $prefix RETURN n.qualifiedName AS qn")
                    .param("prefix", path_prefix.to_string()),
            )
            .await
            .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;

        let mut names = Vec::new();
        while let Some(row) = result
            .next()
            .await
            .map_err(|e| IngestError::GraphCommitError(e.to_string()))?
        {
            let qn: String = row
                .get("qn")
                .map_err(|e| IngestError::GraphCommitError(e.to_string()))?;
            names.push(qn);
        }
        Ok(names)
    }

    async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<(), IngestError> {
        let query = neo4rs::query(
            "MATCH (n {filePath: $old}) \
             SET n.qualifiedName = replace(n.qualifiedName, $old, $new), n.filePath = $new",
        )
        .param("old", old_path.to_string())
        .param("new", new_path.to_string());

        self.graph
            .run(query)
            .await
            .map_err(|e| IngestError::GraphCommitError(e.to_string()))
    }
}

/// In-memory graph, keyed the way `KnowledgeGraph` keys its SQLite-backed
/// node/edge tables, guarded by a single mutex rather than a driver
/// connection. Used in tests and anywhere a live Neo4j server isn't
/// available.
#[derive(Default)]
pub struct FakeGraphStore {
    nodes: Mutex<HashMap<String, Poi>>,
    relationships: Mutex<Vec<RelationshipRecord>>,
}

impl FakeGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("fake graph mutex poisoned").len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships
            .lock()
            .expect("fake graph mutex poisoned")
            .len()
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<Poi> {
        self.nodes
            .lock()
            .expect("fake graph mutex poisoned")
            .values()
            .filter(|p| p.node_type.as_str() == node_type.as_str())
            .cloned()
            .collect()
    }

    pub fn relationships_of_type(&self, edge_type: EdgeType) -> Vec<RelationshipRecord> {
        self.relationships
            .lock()
            .expect("fake graph mutex poisoned")
            .iter()
            .filter(|r| r.edge_type.as_str() == edge_type.as_str())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GraphStore for FakeGraphStore {
    async fn apply_batch(&self, batch: &GraphBatch) -> Result<(), IngestError> {
        let mut nodes = self.nodes.lock().expect("fake graph mutex poisoned");
        for poi in &batch.upsert_nodes {
            nodes.insert(poi.qualified_name.clone(), poi.clone());
        }
        drop(nodes);

        let mut rels = self.relationships.lock().expect("fake graph mutex poisoned");
        rels.extend(batch.upsert_relationships.iter().cloned());
        drop(rels);

        if !batch.delete_qualified_names.is_empty() {
            self.delete_nodes(&batch.delete_qualified_names).await?;
        }
        Ok(())
    }

    async fn delete_nodes(&self, qualified_names: &[String]) -> Result<(), IngestError> {
        let mut nodes = self.nodes.lock().expect("fake graph mutex poisoned");
        for qn in qualified_names {
            nodes.remove(qn);
        }
        drop(nodes);

        let mut rels = self.relationships.lock().expect("fake graph mutex poisoned");
        rels.retain(|r| {
            !qualified_names.contains(&r.source_qualified_name)
                && !qualified_names.contains(&r.target_qualified_name)
        });
        Ok(())
    }

    async fn list_qualified_names_under(&self, path_prefix: &str) -> Result<Vec<String>, IngestError> {
        let nodes = self.nodes.lock().expect("fake graph mutex poisoned");
        Ok(nodes
            .values()
            .filter(|p| p.file_path.starts_with(path_prefix))
            .map(|p| p.qualified_name.clone())
            .collect())
    }

    async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<(), IngestError> {
        let mut nodes = self.nodes.lock().expect("fake graph mutex poisoned");
        let stale_keys: Vec<String> = nodes
            .values()
            .filter(|p| p.file_path == old_path)
            .map(|p| p.qualified_name.clone())
            .collect();

        for key in stale_keys {
            if let Some(mut poi) = nodes.remove(&key) {
                poi.qualified_name = poi.qualified_name.replacen(old_path, new_path, 1);
                poi.file_path = new_path.to_string();
                nodes.insert(poi.qualified_name.clone(), poi);
            }
        }
        drop(nodes);

        let mut rels = self.relationships.lock().expect("fake graph mutex poisoned");
        for rel in rels.iter_mut() {
            if rel.source_qualified_name.starts_with(old_path) {
                rel.source_qualified_name = rel.source_qualified_name.replacen(old_path, new_path, 1);
            }
            if rel.target_qualified_name.starts_with(old_path) {
                rel.target_qualified_name = rel.target_qualified_name.replacen(old_path, new_path, 1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeType;

    fn poi(qn: &str, file_path: &str) -> Poi {
        Poi {
            qualified_name: qn.to_string(),
            name: qn.to_string(),
            node_type: NodeType::Function,
            file_path: file_path.to_string(),
            start_line: Some(1),
            end_line: Some(2),
            is_exported: false,
            signature: None,
        }
    }

    #[tokio::test]
    async fn apply_batch_upserts_nodes() {
        let store = FakeGraphStore::new();
        let batch = GraphBatch {
            upsert_nodes: vec![poi("/repo/a.rs--f", "/repo/a.rs")],
            ..Default::default()
        };
        store.apply_batch(&batch).await.unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn delete_nodes_removes_incident_relationships() {
        let store = FakeGraphStore::new();
        let batch = GraphBatch {
            upsert_nodes: vec![poi("/repo/a.rs--f", "/repo/a.rs"), poi("/repo/a.rs--g", "/repo/a.rs")],
            upsert_relationships: vec![RelationshipRecord {
                source_qualified_name: "/repo/a.rs--f".to_string(),
                target_qualified_name: "/repo/a.rs--g".to_string(),
                edge_type: EdgeType::Calls,
                confidence: 1.0,
                reason: None,
                context: None,
                line_number: None,
            }],
            ..Default::default()
        };
        store.apply_batch(&batch).await.unwrap();
        store.delete_nodes(&["/repo/a.rs--f".to_string()]).await.unwrap();
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.relationship_count(), 0);
    }

    #[tokio::test]
    async fn list_qualified_names_under_filters_by_path_prefix() {
        let store = FakeGraphStore::new();
        let batch = GraphBatch {
            upsert_nodes: vec![poi("/repo/a.rs--f", "/repo/a.rs"), poi("/other/b.rs--g", "/other/b.rs")],
            ..Default::default()
        };
        store.apply_batch(&batch).await.unwrap();
        let names = store.list_qualified_names_under("/repo").await.unwrap();
        assert_eq!(names, vec!["/repo/a.rs--f".to_string()]);
    }

    #[tokio::test]
    async fn rename_path_preserves_node_count_and_edges() {
        let store = FakeGraphStore::new();
        let batch = GraphBatch {
            upsert_nodes: vec![poi("/repo/a.rs--f", "/repo/a.rs"), poi("/repo/a.rs--g", "/repo/a.rs")],
            upsert_relationships: vec![RelationshipRecord {
                source_qualified_name: "/repo/a.rs--f".to_string(),
                target_qualified_name: "/repo/a.rs--g".to_string(),
                edge_type: EdgeType::Calls,
                confidence: 1.0,
                reason: None,
                context: None,
                line_number: None,
            }],
            ..Default::default()
        };
        store.apply_batch(&batch).await.unwrap();

        store.rename_path("/repo/a.rs", "/repo/c.rs").await.unwrap();

        assert_eq!(store.node_count(), 2);
        assert_eq!(store.relationship_count(), 1);
        let renamed = store.nodes_of_type(NodeType::Function);
        assert!(renamed.iter().all(|p| p.file_path == "/repo/c.rs"));
        assert!(renamed.iter().any(|p| p.qualified_name == "/repo/c.rs--f"));
        let rels = store.relationships_of_type(EdgeType::Calls);
        assert_eq!(rels[0].source_qualified_name, "/repo/c.rs--f");
        assert_eq!(rels[0].target_qualified_name, "/repo/c.rs--g");
    }
}
