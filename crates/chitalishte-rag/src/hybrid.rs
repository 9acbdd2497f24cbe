//! Hybrid composition: structured facts first, retrieval second.
//!
//! The SQL pipeline runs first; its narrative seeds the RAG context so the
//! generated elaboration already knows the numbers. The merge is
//! deterministic (SQL-derived facts always precede RAG-derived prose) and
//! each side degrades independently.

use std::sync::Arc;

use crate::error::EngineError;
use crate::rag::{FallbackPolicy, RagPipeline};
use crate::sql::SqlPipeline;
use crate::types::{HallucinationMode, PipelineResult};

const CANNOT_ANSWER: &str = "Не мога да отговоря на този въпрос.";

pub struct HybridComposer {
    sql: Arc<SqlPipeline>,
    rag: Arc<RagPipeline>,
}

impl HybridComposer {
    pub fn new(sql: Arc<SqlPipeline>, rag: Arc<RagPipeline>) -> Self {
        Self { sql, rag }
    }

    pub async fn run(
        &self,
        query: &str,
        history: &str,
        mode: HallucinationMode,
    ) -> Result<PipelineResult, EngineError> {
        let sql_outcome = match self.sql.run(query, history, mode).await {
            Ok(result) => Some(result),
            // A dead model would fail the RAG leg as well.
            Err(e @ EngineError::UpstreamModelUnavailable(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "sql leg failed under hybrid, continuing with retrieval only");
                None
            }
        };

        let seed = sql_outcome.as_ref().map(|r| r.answer.clone());
        let rag_outcome = match self
            .rag
            .run(query, history, mode, FallbackPolicy::Disabled, seed.as_deref())
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                if sql_outcome.is_none() && e.is_retryable() {
                    // Nothing left to degrade to.
                    return Err(e);
                }
                tracing::warn!(error = %e, "rag leg failed under hybrid");
                None
            }
        };

        Ok(merge(sql_outcome, rag_outcome))
    }
}

fn merge(sql: Option<PipelineResult>, rag: Option<PipelineResult>) -> PipelineResult {
    match (sql, rag) {
        (Some(sql), Some(rag)) => {
            let mut merged = PipelineResult {
                // Facts first, elaboration second.
                answer: format!("{}\n\n{}", sql.answer, rag.answer),
                sql_executed: true,
                rag_executed: true,
                sql_query: sql.sql_query,
                rag_metadata: rag.rag_metadata,
                used_fallback_llm: false,
                usage: sql.usage,
            };
            merged.usage.add(rag.usage);
            merged
        }
        (None, Some(rag)) => rag,
        (Some(sql), None) => sql,
        (None, None) => PipelineResult {
            answer: CANNOT_ANSWER.to_string(),
            ..PipelineResult::default()
        },
    }
}
