//! LLM client adapter (spec §4.4, §6.1) and response sanitization/validation.
//!
//! The production client follows `embedding::EmbeddingGenerator`'s shape: a
//! `reqwest::Client`, an API key pulled from the environment, and a
//! `tokio::sync::Semaphore` bounding in-flight calls rather than relying on
//! the provider to reject over-eager callers.

use crate::error::IngestError;
use crate::models::{EdgeType, NodeType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

const DEFAULT_MODEL: &str = "claude-opus-4-5";
const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub body: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, IngestError>;
}

#[derive(Clone)]
pub struct HttpLlmClient {
    api_key: String,
    model: String,
    api_base: String,
    client: reqwest::Client,
    rate_limiter: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(timeout: Duration) -> Result<Self, IngestError> {
        let api_key = env::var("ARGUS_LLM_API_KEY")
            .map_err(|_| IngestError::Unexpected("ARGUS_LLM_API_KEY not set".to_string()))?;
        let model = env::var("ARGUS_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let api_base = env::var("ARGUS_LLM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let concurrency: usize = env::var("ARGUS_LLM_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONCURRENCY);

        Ok(Self {
            api_key,
            model,
            api_base,
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(Semaphore::new(concurrency)),
            timeout,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ChatContentBlock>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, IngestError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| IngestError::LlmCallFailed(format!("rate limiter closed: {e}")))?;

        let body = ChatRequest {
            model: self.model.clone(),
            max_tokens: 8192,
            system: request.system,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.user,
            }],
        };

        let response = self
            .client
            .post(&self.api_base)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| IngestError::LlmCallFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IngestError::LlmCallFailed(format!("rate limit (429): {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IngestError::LlmCallFailed(format!("status {status}: {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| IngestError::LlmCallFailed(format!("malformed response body: {e}")))?;

        let text = parsed
            .content
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            body: text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

/// Fixed test double; never performs network I/O.
pub struct MockLlmClient {
    pub response: String,
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(&self, _request: LlmRequest) -> Result<LlmResponse, IngestError> {
        Ok(LlmResponse {
            body: self.response.clone(),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

/// Raw entity/relationship shape the model is asked to emit (spec §4.4).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    #[serde(default)]
    pub is_exported: bool,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub reason: Option<String>,
    pub context: Option<String>,
    pub line_number: Option<i64>,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AnalysisPayload {
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub relationships: Vec<RawRelationship>,
}

/// Strips markdown code fences and trailing commas a model sometimes wraps
/// JSON output in, then closes a dangling string if an odd number of
/// unescaped quotes suggests the model's output was truncated mid-string
/// (spec §4.4: "if quote-count is odd attempt to close the last open
/// string"), before handing the text to `serde_json`.
pub fn sanitize_json(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fences = if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    };

    let mut out = String::with_capacity(without_fences.len());
    let mut chars = without_fences.chars().peekable();
    let mut quote_count = 0u64;
    while let Some(c) = chars.next() {
        if c == '"' {
            quote_count += 1;
        }
        if c == ',' {
            let mut lookahead = chars.clone();
            while let Some(&next) = lookahead.peek() {
                if next.is_whitespace() {
                    lookahead.next();
                } else {
                    break;
                }
            }
            if matches!(lookahead.peek(), Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    if quote_count % 2 == 1 {
        out.push('"');
    }

    out
}

/// Parses and schema-validates a model response (spec §4.4, §9 Inv. 6):
/// entities/relationships whose `type` falls outside the closed allow-list
/// are dropped with a warning rather than rejecting the whole document,
/// unless the document fails to parse at all, which is a hard reject.
pub fn parse_and_validate(raw: &str) -> Result<AnalysisPayload, IngestError> {
    let cleaned = sanitize_json(raw);
    let payload: AnalysisPayload = serde_json::from_str(&cleaned)
        .map_err(|e| IngestError::InvalidJson(e.to_string()))?;

    let entities = payload
        .entities
        .into_iter()
        .filter(|e| match NodeType::try_from(e.entity_type.as_str()) {
            Ok(_) => true,
            Err(_) => {
                warn!(entity = %e.name, kind = %e.entity_type, "dropping entity with unknown type");
                false
            }
        })
        .collect();

    let relationships = payload
        .relationships
        .into_iter()
        .filter(|r| match EdgeType::try_from(r.edge_type.as_str()) {
            Ok(_) => true,
            Err(_) => {
                warn!(source = %r.source, target = %r.target, kind = %r.edge_type, "dropping relationship with unknown type");
                false
            }
        })
        .collect();

    Ok(AnalysisPayload {
        entities,
        relationships,
    })
}
