//! Query routing and multi-pipeline orchestration for a Bulgarian
//! community-center ("читалище") Q&A service.
//!
//! Natural-language questions are classified by intent and dispatched to
//! a structured-data (SQL) pipeline, a retrieval-augmented pipeline, or a
//! hybrid of both. The engine owns the decision logic, the
//! hallucination-control and fallback policy, conversation state, and the
//! admission gate; the stores and models behind it are capabilities
//! supplied by the caller (see [`providers`]).

pub mod admission;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod hybrid;
pub mod logging;
pub mod output;
pub mod providers;
pub mod rag;
pub mod routing;
pub mod sql;
pub mod stream;
pub mod types;

// Re-export primary types for convenience
pub use config::EngineConfig;
pub use engine::ChatEngine;
pub use error::EngineError;
pub use providers::{ChatLogSink, ChatModel, CorpusTag, Retriever, SqlStore};
pub use stream::{ResponseStream, StreamEvent};
pub use types::{
    ChatRequest, ChatResponse, HallucinationMode, Intent, IntentDecision, Message, OutputFormat,
    PipelineResult,
};

// Re-export common types
pub use anyhow::Result;
pub use uuid::Uuid;
