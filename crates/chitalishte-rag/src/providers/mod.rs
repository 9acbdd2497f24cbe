//! Capability interfaces the engine consumes.
//!
//! The relational store, the vector index and the language model are
//! external collaborators; the engine only sees these traits. Providers
//! return `anyhow::Result`; the engine maps failures into its own
//! taxonomy at the call site.

pub mod openai;
pub mod registry;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::logging::ChatLogRecord;

// ============================================================================
// Language model
// ============================================================================

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// One completed model invocation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub latency_ms: u64,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerationOptions)
        -> anyhow::Result<Generation>;
}

// ============================================================================
// Vector retrieval
// ============================================================================

/// Logical corpus a passage belongs to. Database summaries are
/// authoritative for factual claims; analysis chunks are explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusTag {
    Database,
    AnalysisDocument,
}

#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub text: String,
    pub metadata: HashMap<String, String>,
    pub score: f32,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Passages for `query` from one corpus, best match first.
    async fn search(
        &self,
        query: &str,
        corpus: CorpusTag,
        top_k: usize,
    ) -> anyhow::Result<Vec<ScoredPassage>>;
}

// ============================================================================
// Structured data
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SqlRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[async_trait]
pub trait SqlStore: Send + Sync {
    /// Execute a single validated read statement. The store connection
    /// itself must be read-only; validation happens before this call.
    async fn execute_readonly(&self, sql: &str) -> anyhow::Result<SqlRows>;
}

// ============================================================================
// Chat log sink
// ============================================================================

#[async_trait]
pub trait ChatLogSink: Send + Sync {
    /// Append one request record. Failures are the sink's problem; the
    /// engine logs and moves on.
    async fn append(&self, record: ChatLogRecord) -> anyhow::Result<()>;
}

/// In-memory sink, useful for tests and local runs.
#[derive(Default)]
pub struct MemoryLogSink {
    records: parking_lot::Mutex<Vec<ChatLogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ChatLogRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ChatLogSink for MemoryLogSink {
    async fn append(&self, record: ChatLogRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

// ============================================================================
// Test doubles
// ============================================================================
