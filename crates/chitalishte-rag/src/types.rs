//! Wire and domain types shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Request / response
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// User question, in Bulgarian.
    pub message: String,
    /// Conversation to continue. Absent or unknown ids start a fresh one.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mode: HallucinationMode,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub conversation_id: String,
    pub intent: Intent,
    pub routing_confidence: f32,
    pub mode: HallucinationMode,
    pub sql_executed: bool,
    pub rag_executed: bool,
    pub metadata: ResponseMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_metadata: Option<RetrievalMetadata>,
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Sql,
    Rag,
    Hybrid,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Sql => "sql",
            Intent::Rag => "rag",
            Intent::Hybrid => "hybrid",
        }
    }
}

/// One classifier's opinion: a candidate intent plus how sure it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub intent: Intent,
    pub confidence: f32,
}

/// Final routing decision. Immutable once produced; the orchestrator
/// consumes it exactly once.
#[derive(Debug, Clone)]
pub struct IntentDecision {
    pub intent: Intent,
    pub confidence: f32,
    pub rule: Option<Signal>,
    pub model: Option<Signal>,
    pub matched_rules: Vec<String>,
    pub explanation: String,
}

// ============================================================================
// Generation behavior
// ============================================================================

/// Controls generation strictness vs. creativity. Never changes retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HallucinationMode {
    Low,
    #[default]
    Medium,
    High,
}

impl HallucinationMode {
    /// Sampling temperature for answer generation in this mode.
    pub fn temperature(&self) -> f32 {
        match self {
            HallucinationMode::Low => 0.0,
            HallucinationMode::Medium => 0.3,
            HallucinationMode::High => 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Table,
    Bullets,
    Statistics,
}

// ============================================================================
// Pipeline results
// ============================================================================

/// Retrieval bookkeeping surfaced in response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetadata {
    pub db_documents: usize,
    pub analysis_documents: usize,
    pub total_documents: usize,
}

/// Token accounting accumulated over the model calls of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// What a pipeline produced. The execution flags are orthogonal to the
/// routed intent: hybrid may set both, a failed pipeline neither.
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub answer: String,
    pub sql_executed: bool,
    pub rag_executed: bool,
    pub sql_query: Option<String>,
    pub rag_metadata: Option<RetrievalMetadata>,
    pub used_fallback_llm: bool,
    pub usage: TokenUsage,
}
