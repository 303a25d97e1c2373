use thiserror::Error;

/// Closed failure taxonomy for the pipeline (see spec §7). Every variant maps to
/// exactly one row of the error-handling table: a place it originates, a local
/// recovery strategy, and a surface it is reported through.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Detail is never shown to callers outside this crate; only logged internally.
    #[error("invalid file path")]
    PathTraversal { detail: String },

    #[error("file too large ({size} bytes > limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("failed to read file: {0}")]
    ReadError(String),

    #[error("llm call failed: {0}")]
    LlmCallFailed(String),

    #[error("invalid json in llm response: {0}")]
    InvalidJson(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("graph commit failed: {0}")]
    GraphCommitError(String),

    #[error("relational store error: {0}")]
    RelationalError(#[from] rusqlite::Error),

    #[error("reconcile graph step failed: {0}")]
    ReconcileGraphError(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Coarse error-kind used to pick a retry back-off base (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    NetworkOrTimeout,
    Validation,
    Other,
}

impl IngestError {
    /// The taxonomy label persisted on `failed_work.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::PathTraversal { .. } => "PATH_TRAVERSAL",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::ReadError(_) => "READ_ERROR",
            Self::LlmCallFailed(_) => "LLM_CALL_FAILED",
            Self::InvalidJson(_) => "VALIDATION_FAILED",
            Self::SchemaValidation(_) => "VALIDATION_FAILED",
            Self::GraphCommitError(_) => "GRAPH_COMMIT_ERROR",
            Self::RelationalError(_) => "RELATIONAL_ERROR",
            Self::ReconcileGraphError(_) => "RECONCILE_GRAPH_ERROR",
            Self::Unexpected(_) => "UNEXPECTED",
        }
    }

    /// User-visible message: strips internal detail for the two kinds the spec
    /// says must never leak paths or stack traces.
    pub fn public_message(&self) -> String {
        match self {
            Self::PathTraversal { .. } => "Invalid file path".to_string(),
            other => other.to_string(),
        }
    }

    pub fn retry_kind(&self) -> ErrorKind {
        match self {
            Self::LlmCallFailed(msg) if msg.contains("rate limit") || msg.contains("429") => {
                ErrorKind::RateLimit
            }
            Self::LlmCallFailed(_) => ErrorKind::NetworkOrTimeout,
            Self::InvalidJson(_) | Self::SchemaValidation(_) => ErrorKind::Validation,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LlmCallFailed(_) | Self::InvalidJson(_) | Self::SchemaValidation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_traversal_hides_detail() {
        let err = IngestError::PathTraversal {
            detail: "/etc/passwd escaped /repo".to_string(),
        };
        assert_eq!(err.public_message(), "Invalid file path");
    }

    #[test]
    fn error_type_labels_match_taxonomy() {
        assert_eq!(
            IngestError::FileNotFound("x".into()).error_type(),
            "FILE_NOT_FOUND"
        );
        assert_eq!(
            IngestError::FileTooLarge { size: 2, limit: 1 }.error_type(),
            "FILE_TOO_LARGE"
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(IngestError::LlmCallFailed("timeout".into()).is_retryable());
        assert!(!IngestError::FileTooLarge { size: 2, limit: 1 }.is_retryable());
    }
}
