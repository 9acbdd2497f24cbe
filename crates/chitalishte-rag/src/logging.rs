//! Per-request chat log records.
//!
//! One record per completed turn, shipped to the external log sink. Token
//! counts come from the model calls of the turn; the cost estimate uses
//! the configured per-1k-token rates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CostConfig;
use crate::types::{HallucinationMode, Intent, OutputFormat, TokenUsage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatLogRecord {
    pub request_id: String,
    pub conversation_id: String,
    pub client_ip: String,
    pub user_message: String,
    pub answer: String,
    pub intent: Intent,
    pub routing_confidence: f32,
    pub hallucination_mode: HallucinationMode,
    pub output_format: OutputFormat,
    pub sql_executed: bool,
    pub rag_executed: bool,
    pub used_fallback_llm: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub estimated_cost_usd: f64,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Estimated request cost in USD from token counts.
pub fn estimate_cost(usage: TokenUsage, cost: &CostConfig) -> f64 {
    usage.input_tokens as f64 / 1000.0 * cost.input_per_1k
        + usage.output_tokens as f64 / 1000.0 * cost.output_per_1k
}
