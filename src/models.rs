//! Shared data types for the pipeline (spec §3).
//!
//! `NodeType` and `EdgeType` are closed enumerations rather than open strings:
//! per the design note in spec §9 ("represent POI and relationship kinds as
//! closed enumerations"), this makes the Cypher-injection allow-list check
//! (spec Inv. 6) a property of the type system instead of a runtime gate that
//! could be forgotten at a call site.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Graph node label allow-list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeType {
    Function,
    Class,
    Variable,
    File,
    Database,
    Table,
    View,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "Function",
            Self::Class => "Class",
            Self::Variable => "Variable",
            Self::File => "File",
            Self::Database => "Database",
            Self::Table => "Table",
            Self::View => "View",
        }
    }

    pub const ALL: [NodeType; 7] = [
        Self::Function,
        Self::Class,
        Self::Variable,
        Self::File,
        Self::Database,
        Self::Table,
        Self::View,
    ];
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for NodeType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "variable" => Ok(Self::Variable),
            "file" => Ok(Self::File),
            "database" => Ok(Self::Database),
            "table" => Ok(Self::Table),
            "view" => Ok(Self::View),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Graph edge type allow-list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EdgeType {
    Contains,
    Calls,
    Uses,
    Imports,
    Exports,
    Extends,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "CONTAINS",
            Self::Calls => "CALLS",
            Self::Uses => "USES",
            Self::Imports => "IMPORTS",
            Self::Exports => "EXPORTS",
            Self::Extends => "EXTENDS",
        }
    }

    pub const ALL: [EdgeType; 6] = [
        Self::Contains,
        Self::Calls,
        Self::Uses,
        Self::Imports,
        Self::Exports,
        Self::Extends,
    ];
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for EdgeType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_uppercase().as_str() {
            "CONTAINS" => Ok(Self::Contains),
            "CALLS" => Ok(Self::Calls),
            "USES" => Ok(Self::Uses),
            "IMPORTS" => Ok(Self::Imports),
            "EXPORTS" => Ok(Self::Exports),
            "EXTENDS" => Ok(Self::Extends),
            other => Err(format!("unknown relationship type: {other}")),
        }
    }
}

/// A point of interest: a graph node (spec §3, glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    pub qualified_name: String,
    pub name: String,
    pub node_type: NodeType,
    pub file_path: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub is_exported: bool,
    pub signature: Option<String>,
}

impl Poi {
    /// `qualifiedName = "<absolute_file_path>--<entityName>"`; File nodes key
    /// on the absolute path alone (glossary).
    pub fn qualified_name_for(node_type: NodeType, file_path: &str, entity_name: &str) -> String {
        if matches!(node_type, NodeType::File) {
            file_path.to_string()
        } else {
            format!("{file_path}--{entity_name}")
        }
    }

    pub fn external(module: &str, entity_name: &str) -> String {
        format!("{module}--{entity_name}")
    }
}

/// A typed graph edge (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub source_qualified_name: String,
    pub target_qualified_name: String,
    pub edge_type: EdgeType,
    pub confidence: f64,
    pub reason: Option<String>,
    pub context: Option<String>,
    pub line_number: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PendingDeletion,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PendingDeletion => "pending_deletion",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "pending_deletion" => Self::PendingDeletion,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub path: String,
    pub absolute_path: String,
    pub content_hash: String,
    pub language: Option<String>,
    pub size: i64,
    pub special_type: Option<String>,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: i64,
    pub file_id: String,
    pub file_path: String,
    pub content_hash: String,
    pub project_context: Option<String>,
    pub status: WorkItemStatus,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisResultStatus {
    PendingIngestion,
    Ingested,
    ValidationFailed,
}

impl AnalysisResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingIngestion => "pending_ingestion",
            Self::Ingested => "ingested",
            Self::ValidationFailed => "validation_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub id: i64,
    pub work_item_id: i64,
    pub file_path: String,
    pub absolute_file_path: String,
    pub llm_output: String,
    pub status: AnalysisResultStatus,
    pub validation_passed: bool,
    pub entities_count: i64,
    pub relationships_count: i64,
    pub retry_count: i64,
    pub processing_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefactoringKind {
    Delete,
    Rename,
}

impl RefactoringKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Rename => "RENAME",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "RENAME" => Self::Rename,
            _ => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefactoringStatus {
    Pending,
    Completed,
}

impl RefactoringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefactoringTask {
    pub id: i64,
    pub kind: RefactoringKind,
    pub old_absolute_path: String,
    pub new_absolute_path: Option<String>,
    pub status: RefactoringStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips() {
        for nt in NodeType::ALL {
            let s = nt.as_str();
            assert_eq!(NodeType::try_from(s).unwrap(), nt);
        }
    }

    #[test]
    fn edge_type_round_trips() {
        for et in EdgeType::ALL {
            let s = et.as_str();
            assert_eq!(EdgeType::try_from(s).unwrap(), et);
        }
    }

    #[test]
    fn unknown_node_type_rejected() {
        assert!(NodeType::try_from("Macro").is_err());
    }

    #[test]
    fn unknown_edge_type_rejected() {
        assert!(EdgeType::try_from("OWNS").is_err());
    }

    #[test]
    fn qualified_name_for_file_is_the_path() {
        let qn = Poi::qualified_name_for(NodeType::File, "/repo/a.js", "a.js");
        assert_eq!(qn, "/repo/a.js");
    }

    #[test]
    fn qualified_name_for_entity_joins_with_double_dash() {
        let qn = Poi::qualified_name_for(NodeType::Function, "/repo/a.js", "f");
        assert_eq!(qn, "/repo/a.js--f");
    }

    #[test]
    fn external_qualified_name() {
        assert_eq!(Poi::external("react", "useState"), "react--useState");
    }
}
