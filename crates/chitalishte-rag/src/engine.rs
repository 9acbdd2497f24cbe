//! The orchestrator: admission, routing, dispatch and response assembly.
//!
//! One `process` call per turn: the request passes admission control,
//! resolves its conversation, gets classified, runs the selected
//! pipeline, and comes back as a unified response. Classifier and
//! single-pipeline failures degrade into a usable answer; only admission
//! rejections and infrastructure faults surface as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::admission::AdmissionControl;
use crate::config::EngineConfig;
use crate::conversation::ConversationStore;
use crate::error::EngineError;
use crate::hybrid::HybridComposer;
use crate::logging::{estimate_cost, ChatLogRecord};
use crate::output;
use crate::providers::registry::ModelRegistry;
use crate::providers::{ChatLogSink, ChatModel, Retriever, SqlStore};
use crate::rag::{FallbackPolicy, RagPipeline};
use crate::routing::IntentRouter;
use crate::sql::SqlPipeline;
use crate::stream::{chunk_text, ResponseStream, StreamEvent};
use crate::types::{
    ChatRequest, ChatResponse, Intent, Message, PipelineResult, ResponseMetadata, Role,
};

const CANNOT_ANSWER_NUMERICALLY: &str =
    "Не мога да предоставя числов отговор на този въпрос.";

pub struct ChatEngine {
    config: EngineConfig,
    admission: Arc<AdmissionControl>,
    conversations: Arc<ConversationStore>,
    router: IntentRouter,
    sql: Arc<SqlPipeline>,
    rag: Arc<RagPipeline>,
    hybrid: HybridComposer,
    log_sink: Arc<dyn ChatLogSink>,
}

impl ChatEngine {
    pub fn new(
        config: EngineConfig,
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        store: Arc<dyn SqlStore>,
        log_sink: Arc<dyn ChatLogSink>,
    ) -> Self {
        let registry = ModelRegistry::new(config.models.clone());
        let router = IntentRouter::new(model.clone(), &registry, config.routing.clone());
        let sql = Arc::new(SqlPipeline::new(
            model.clone(),
            store,
            &registry,
            config.sql.clone(),
        ));
        let rag = Arc::new(RagPipeline::new(
            model,
            retriever,
            &registry,
            config.retrieval.clone(),
            config.rag.clone(),
        ));
        let hybrid = HybridComposer::new(sql.clone(), rag.clone());
        let admission = Arc::new(AdmissionControl::new(
            config.rate_limit.clone(),
            config.abuse.clone(),
        ));

        Self {
            config,
            admission,
            conversations: Arc::new(ConversationStore::new()),
            router,
            sql,
            rag,
            hybrid,
            log_sink,
        }
    }

    /// Start the background pruning of admission state.
    pub fn start_cleanup(&self) -> tokio::task::JoinHandle<()> {
        self.admission
            .spawn_cleanup(Duration::from_secs(self.config.rate_limit.cleanup_interval_secs))
    }

    /// Handle one chat turn end to end.
    pub async fn process(
        &self,
        request: ChatRequest,
        client_ip: &str,
    ) -> Result<ChatResponse, EngineError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        self.admission.admit(
            client_ip,
            request.conversation_id.as_deref(),
            request.message.chars().count(),
        )?;

        // Unknown or missing ids silently start a new conversation.
        let conversation_id = match request.conversation_id.as_deref() {
            Some(id) if self.conversations.exists(id) => id.to_string(),
            _ => self.conversations.create(),
        };

        // Context covers the turns before this one.
        let history = self.conversations.context_window(
            &conversation_id,
            self.config.conversation.context_window_messages,
        );
        self.conversations
            .append(&conversation_id, Role::User, &request.message);

        let decision = self.router.classify(&request.message, &history).await;

        let outcome = match decision.intent {
            Intent::Sql => match self.sql.run(&request.message, &history, request.mode).await {
                Ok(result) => result,
                Err(e @ EngineError::UpstreamModelUnavailable(_)) => return Err(e),
                Err(e) => {
                    // Unsafe, unparseable or failed SQL degrades to an honest
                    // "cannot answer" without leaking the statement.
                    tracing::warn!(error = %e, "sql pipeline failed, degrading");
                    PipelineResult {
                        answer: CANNOT_ANSWER_NUMERICALLY.to_string(),
                        ..PipelineResult::default()
                    }
                }
            },
            Intent::Rag => {
                self.rag
                    .run(
                        &request.message,
                        &history,
                        request.mode,
                        FallbackPolicy::Enabled,
                        None,
                    )
                    .await?
            }
            Intent::Hybrid => self.hybrid.run(&request.message, &history, request.mode).await?,
        };

        let structured_output = output::format(&outcome.answer, request.output_format);
        let display_answer = structured_output
            .as_ref()
            .and_then(|v| v.get("formatted_answer"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| outcome.answer.clone());

        // History keeps the unformatted answer.
        self.conversations
            .append(&conversation_id, Role::Assistant, &outcome.answer);

        let latency_ms = started.elapsed().as_millis() as u64;
        let record = ChatLogRecord {
            request_id: request_id.clone(),
            conversation_id: conversation_id.clone(),
            client_ip: client_ip.to_string(),
            user_message: request.message.clone(),
            answer: outcome.answer.clone(),
            intent: decision.intent,
            routing_confidence: decision.confidence,
            hallucination_mode: request.mode,
            output_format: request.output_format,
            sql_executed: outcome.sql_executed,
            rag_executed: outcome.rag_executed,
            used_fallback_llm: outcome.used_fallback_llm,
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
            estimated_cost_usd: estimate_cost(outcome.usage, &self.config.cost),
            latency_ms,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.log_sink.append(record).await {
            tracing::warn!(error = %e, request_id = %request_id, "chat log append failed");
        }

        tracing::info!(
            request_id = %request_id,
            conversation_id = %conversation_id,
            intent = decision.intent.as_str(),
            confidence = decision.confidence,
            sql_executed = outcome.sql_executed,
            rag_executed = outcome.rag_executed,
            latency_ms,
            "chat turn completed"
        );

        Ok(ChatResponse {
            answer: display_answer,
            conversation_id,
            intent: decision.intent,
            routing_confidence: decision.confidence,
            mode: request.mode,
            sql_executed: outcome.sql_executed,
            rag_executed: outcome.rag_executed,
            metadata: ResponseMetadata {
                routing_explanation: Some(decision.explanation),
                sql_query: outcome.sql_query,
                rag_metadata: outcome.rag_metadata,
            },
            structured_output,
        })
    }

    /// Streaming variant: token chunks, then a JSON summary, then the
    /// end-of-stream marker. A dropped consumer cancels the pipeline work.
    pub fn process_stream(self: &Arc<Self>, request: ChatRequest, client_ip: String) -> ResponseStream {
        let engine = Arc::clone(self);
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let result = tokio::select! {
                result = engine.process(request, &client_ip) => result,
                // Client disconnected before the answer was ready.
                _ = tx.closed() => return,
            };

            match result {
                Ok(response) => {
                    for chunk in chunk_text(&response.answer) {
                        if tx.send(StreamEvent::Token(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let summary = serde_json::json!({
                        "conversation_id": response.conversation_id,
                        "intent": response.intent,
                        "routing_confidence": response.routing_confidence,
                        "mode": response.mode,
                        "sql_executed": response.sql_executed,
                        "rag_executed": response.rag_executed,
                    });
                    let _ = tx.send(StreamEvent::Summary(summary)).await;
                    let _ = tx.send(StreamEvent::Done).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Summary(serde_json::json!({ "error": e.to_string() })))
                        .await;
                    let _ = tx.send(StreamEvent::Done).await;
                }
            }
        });

        ResponseStream::new(rx)
    }

    /// Ordered message history for a known conversation.
    pub fn history(&self, conversation_id: &str) -> Result<Vec<Message>, EngineError> {
        if !self.conversations.exists(conversation_id) {
            return Err(EngineError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(self.conversations.messages(conversation_id))
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        if self.conversations.delete(conversation_id) {
            Ok(())
        } else {
            Err(EngineError::ConversationNotFound(conversation_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::{FixedRetriever, FixedSqlStore, ScriptedModel};
    use crate::providers::MemoryLogSink;
    use crate::types::{HallucinationMode, OutputFormat};

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        // Tests fire requests back-to-back; keep the abuse gate out of the way.
        config.abuse.enabled = false;
        config.rate_limit.per_minute = 100;
        config.rate_limit.per_hour = 100;
        config.rate_limit.per_day = 100;
        config
    }

    fn engine_with(config: EngineConfig, model: ScriptedModel) -> (Arc<ChatEngine>, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::new());
        let retriever = Arc::new(FixedRetriever {
            db: vec![FixedRetriever::passage("В Пловдив има 17 читалища.", 0.9)],
            analysis: vec![FixedRetriever::passage("Читалищата са възрожденски средища.", 0.8)],
        });
        let store = Arc::new(FixedSqlStore::with_rows(vec!["count"], vec![vec!["17"]]));
        let engine = ChatEngine::new(config, Arc::new(model), retriever, store, sink.clone());
        (Arc::new(engine), sink)
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            conversation_id: None,
            mode: HallucinationMode::Medium,
            output_format: OutputFormat::Text,
            stream: false,
        }
    }

    #[tokio::test]
    async fn counting_question_routes_to_sql() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"sql","confidence":0.9,"reason":"Пита за брой."}"#,
            "SELECT COUNT(*) FROM chitalishte WHERE town = 'Пловдив'",
        ]);
        let (engine, sink) = engine_with(test_config(), model);

        let response = engine
            .process(request("Колко читалища има в Пловдив?"), "10.1.0.1")
            .await
            .unwrap();

        assert_eq!(response.intent, Intent::Sql);
        assert!(!response.conversation_id.is_empty());
        assert!(response.sql_executed);
        assert!(!response.rag_executed);
        assert_eq!(response.answer, "Резултатът е 17.");
        assert!(response.metadata.sql_query.is_some());
        assert!(response.metadata.routing_explanation.is_some());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].intent, Intent::Sql);
        assert!(records[0].sql_executed);
    }

    #[tokio::test]
    async fn definition_question_routes_to_rag() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"Описателен въпрос."}"#,
            "Читалището е българска културна институция.",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let response = engine
            .process(request("Какво е читалище?"), "10.1.0.2")
            .await
            .unwrap();

        assert_eq!(response.intent, Intent::Rag);
        assert!(!response.sql_executed);
        assert!(response.rag_executed);
        assert_eq!(response.answer, "Читалището е българска културна институция.");
        assert!(response.metadata.rag_metadata.is_some());
    }

    #[tokio::test]
    async fn unknown_conversation_id_starts_a_new_conversation() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"Описателен."}"#,
            "Отговор.",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let mut req = request("Какво е читалище?");
        req.conversation_id = Some("no-such-conversation".to_string());
        let response = engine.process(req, "10.1.0.3").await.unwrap();

        assert_ne!(response.conversation_id, "no-such-conversation");
        assert!(engine.history(&response.conversation_id).is_ok());
    }

    #[tokio::test]
    async fn second_turn_carries_conversation_context() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"Описателен."}"#,
            "Читалището е културна институция.",
            r#"{"intent":"rag","confidence":0.9,"reason":"Следващ въпрос."}"#,
            "Възникват през Възраждането.",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let first = engine
            .process(request("Какво е читалище?"), "10.1.0.4")
            .await
            .unwrap();
        let mut second = request("А кога възникват?");
        second.conversation_id = Some(first.conversation_id.clone());
        let second_resp = engine.process(second, "10.1.0.4").await.unwrap();

        assert_eq!(second_resp.conversation_id, first.conversation_id);
        let history = engine.history(&first.conversation_id).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[2].content, "А кога възникват?");
    }

    #[tokio::test]
    async fn history_reads_are_idempotent_and_deletable() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"Описателен."}"#,
            "Отговор.",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let response = engine
            .process(request("Какво е читалище?"), "10.1.0.5")
            .await
            .unwrap();
        let id = response.conversation_id;

        let first: Vec<String> = engine.history(&id).unwrap().iter().map(|m| m.content.clone()).collect();
        let second: Vec<String> = engine.history(&id).unwrap().iter().map(|m| m.content.clone()).collect();
        assert_eq!(first, second);

        engine.delete_conversation(&id).unwrap();
        assert!(matches!(
            engine.history(&id),
            Err(EngineError::ConversationNotFound(_))
        ));
        assert!(matches!(
            engine.delete_conversation(&id),
            Err(EngineError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn sixth_request_in_a_minute_is_rate_limited() {
        let mut config = test_config();
        config.rate_limit.per_minute = 5;
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"х"}"#,
            "Отговор.",
            r#"{"intent":"rag","confidence":0.9,"reason":"х"}"#,
            "Отговор.",
            r#"{"intent":"rag","confidence":0.9,"reason":"х"}"#,
            "Отговор.",
            r#"{"intent":"rag","confidence":0.9,"reason":"х"}"#,
            "Отговор.",
            r#"{"intent":"rag","confidence":0.9,"reason":"х"}"#,
            "Отговор.",
        ]);
        let (engine, _) = engine_with(config, model);

        for _ in 0..5 {
            engine
                .process(request("Какво е читалище?"), "10.1.0.6")
                .await
                .unwrap();
        }
        match engine.process(request("Какво е читалище?"), "10.1.0.6").await {
            Err(EngineError::RateLimited { retry_after, .. }) => {
                assert!(retry_after.as_secs() <= 60);
            }
            other => panic!("expected rate limit, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn degraded_sql_still_produces_an_answer() {
        // Model votes sql but produces an unsafe statement.
        let model = ScriptedModel::new(vec![
            r#"{"intent":"sql","confidence":0.95,"reason":"брой"}"#,
            "WITH x AS (DELETE FROM chitalishte) SELECT * FROM x",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let response = engine
            .process(request("Колко читалища има?"), "10.1.0.7")
            .await
            .unwrap();

        assert_eq!(response.answer, CANNOT_ANSWER_NUMERICALLY);
        assert!(!response.sql_executed);
        // The rejected statement never leaks into the response.
        assert!(response.metadata.sql_query.is_none());
    }

    #[tokio::test]
    async fn classifier_failure_degrades_to_rules() {
        // Classification reply is garbage; rules say sql; generation follows.
        let model = ScriptedModel::new(vec![
            "изобщо не е JSON",
            "SELECT COUNT(*) FROM chitalishte WHERE town = 'Пловдив'",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let response = engine
            .process(request("Колко читалища има в Пловдив?"), "10.1.0.8")
            .await
            .unwrap();

        assert_eq!(response.intent, Intent::Sql);
        assert!(response.sql_executed);
    }

    #[tokio::test]
    async fn bullets_format_reshapes_the_answer() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"Описателен."}"#,
            "Читалището е институция. Съществува от 19 век.",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let mut req = request("Какво е читалище?");
        req.output_format = OutputFormat::Bullets;
        let response = engine.process(req, "10.1.0.9").await.unwrap();

        assert!(response.structured_output.is_some());
        assert!(response.answer.starts_with("- "));
        // History keeps the raw answer.
        let history = engine.history(&response.conversation_id).unwrap();
        assert_eq!(history[1].content, "Читалището е институция. Съществува от 19 век.");
    }

    #[tokio::test]
    async fn streaming_emits_tokens_summary_and_done() {
        let model = ScriptedModel::new(vec![
            r#"{"intent":"rag","confidence":0.9,"reason":"Описателен."}"#,
            "Читалищата са културни средища, възникнали през Възраждането в България.",
        ]);
        let (engine, _) = engine_with(test_config(), model);

        let stream = engine.process_stream(request("Какво е читалище?"), "10.1.0.10".into());
        let events = stream.collect().await;

        assert!(events.len() >= 3);
        let mut text = String::new();
        let mut saw_summary = false;
        for event in &events[..events.len() - 1] {
            match event {
                StreamEvent::Token(token) => {
                    assert!(!saw_summary, "tokens must precede the summary");
                    text.push_str(token);
                }
                StreamEvent::Summary(summary) => {
                    saw_summary = true;
                    assert_eq!(summary["intent"], "rag");
                    assert!(summary["conversation_id"].is_string());
                }
                StreamEvent::Done => panic!("done must be last"),
            }
        }
        assert_eq!(
            text,
            "Читалищата са културни средища, възникнали през Възраждането в България."
        );
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn streaming_reports_admission_errors_in_band() {
        let mut config = test_config();
        config.rate_limit.per_minute = 5;
        config.rate_limit.per_hour = 5;
        config.rate_limit.per_day = 5;
        let model = ScriptedModel::failing();
        let (engine, _) = engine_with(config, model);

        // Exhaust the window without touching the model.
        for _ in 0..5 {
            let _ = engine.process(request("Какво е читалище?"), "10.1.0.11").await;
        }
        let stream = engine.process_stream(request("Какво е читалище?"), "10.1.0.11".into());
        let events = stream.collect().await;
        match &events[0] {
            StreamEvent::Summary(summary) => {
                assert!(summary["error"].as_str().unwrap().contains("rate limit"));
            }
            other => panic!("expected error summary, got {:?}", other),
        }
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }
}
