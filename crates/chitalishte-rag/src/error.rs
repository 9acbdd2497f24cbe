//! Engine failure taxonomy.
//!
//! Admission rejections and upstream faults are the only errors a caller
//! sees; classifier and single-pipeline failures are recovered inside the
//! orchestrator and degrade into a usable answer.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A rate window for the requesting IP or session is exhausted.
    #[error("rate limit exceeded ({scope}), retry after {retry_after:?}")]
    RateLimited {
        /// Which window tripped: "minute", "hour" or "day".
        scope: &'static str,
        /// Time remaining in the smallest violated window.
        retry_after: Duration,
    },

    /// The IP is under a temporary abuse block.
    #[error("client is temporarily blocked for another {remaining:?}")]
    Blocked { remaining: Duration },

    /// Query body exceeds the configured maximum length.
    #[error("query of {length} chars exceeds the maximum of {max}")]
    QueryTooLong { length: usize, max: usize },

    /// A generated statement failed safety validation. Never executed; the
    /// statement is kept for audit and must not reach the end user.
    #[error("generated SQL rejected: {reason}")]
    SqlUnsafe { reason: String, statement: String },

    /// The model produced no usable SQL statement.
    #[error("could not derive a SQL statement from the question")]
    SqlGenerationFailed,

    /// The read-only store rejected or failed the statement.
    #[error("SQL execution failed")]
    SqlExecutionFailed(#[source] anyhow::Error),

    /// The language-model capability is down. Fatal for the request.
    #[error("upstream model unavailable")]
    UpstreamModelUnavailable(#[source] anyhow::Error),

    /// The vector-search capability failed on the authoritative corpus.
    #[error("retrieval failed")]
    RetrievalFailed(#[source] anyhow::Error),

    /// Only produced by the history surface; the chat path silently starts
    /// a new conversation instead.
    #[error("conversation {0} not found")]
    ConversationNotFound(String),
}

impl EngineError {
    /// True for faults the caller may retry later; admission rejections
    /// carry their own retry hint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SqlExecutionFailed(_)
                | EngineError::UpstreamModelUnavailable(_)
                | EngineError::RetrievalFailed(_)
        )
    }
}
