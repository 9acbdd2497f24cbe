//! Retrieval-augmented pipeline.
//!
//! Retrieves from the two corpora, assembles a deterministic context,
//! generates under the requested hallucination mode, and (standalone
//! only) retries once with the stronger fallback model when the answer
//! amounts to "no information".

pub mod context;

use std::sync::Arc;

use crate::config::{RagConfig, RetrievalConfig};
use crate::error::EngineError;
use crate::providers::registry::{ModelRegistry, Task};
use crate::providers::{ChatModel, CorpusTag, GenerationOptions, Retriever};
use crate::routing::rules;
use crate::types::{HallucinationMode, PipelineResult, TokenUsage};

/// Whether the no-information retry may run. Disabled under hybrid so a
/// single turn never pays for the stronger model twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    Enabled,
    Disabled,
}

pub struct RagPipeline {
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
    generation: GenerationOptions,
    fallback: GenerationOptions,
    retrieval: RetrievalConfig,
    config: RagConfig,
}

impl RagPipeline {
    pub fn new(
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        registry: &ModelRegistry,
        retrieval: RetrievalConfig,
        config: RagConfig,
    ) -> Self {
        Self {
            model,
            retriever,
            generation: registry.options(Task::Generation),
            fallback: registry.options(Task::Fallback),
            retrieval,
            config,
        }
    }

    /// Answer a descriptive question from the corpora. `seed` carries
    /// authoritative extra context (the SQL narrative under hybrid) and is
    /// placed ahead of everything retrieved.
    pub async fn run(
        &self,
        query: &str,
        history: &str,
        mode: HallucinationMode,
        policy: FallbackPolicy,
        seed: Option<&str>,
    ) -> Result<PipelineResult, EngineError> {
        // The authoritative corpus always participates; analysis chunks
        // join only when the question asks for more than a bare fact.
        let db = self
            .retriever
            .search(query, CorpusTag::Database, self.retrieval.db_top_k)
            .await
            .map_err(EngineError::RetrievalFailed)?;

        let analysis = if rules::is_purely_factual(query) {
            Vec::new()
        } else {
            match self
                .retriever
                .search(query, CorpusTag::AnalysisDocument, self.retrieval.analysis_top_k)
                .await
            {
                Ok(passages) => passages,
                Err(e) => {
                    tracing::warn!(error = %e, "analysis corpus retrieval failed, continuing without it");
                    Vec::new()
                }
            }
        };

        let assembled = context::assemble(
            &db,
            &analysis,
            seed,
            self.retrieval.context_budget_chars,
        );

        let prompt = build_answer_prompt(query, history, &assembled.text, mode);
        let mut options = self.generation.clone();
        options.temperature = mode.temperature();

        let generation = self
            .model
            .generate(&prompt, &options)
            .await
            .map_err(EngineError::UpstreamModelUnavailable)?;

        let mut usage = TokenUsage {
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
        };
        let mut answer = generation.text;
        let mut used_fallback_llm = false;

        if policy == FallbackPolicy::Enabled
            && self.config.enable_fallback
            && self.is_no_information(&answer)
        {
            tracing::info!(model = %self.fallback.model_id, "no-information answer, retrying with fallback model");
            let mut fallback_options = self.fallback.clone();
            fallback_options.temperature = mode.temperature();

            // Strictly sequential single retry over the same context.
            match self.model.generate(&prompt, &fallback_options).await {
                Ok(retry) => {
                    usage.add(TokenUsage {
                        input_tokens: retry.input_tokens,
                        output_tokens: retry.output_tokens,
                    });
                    if self.is_no_information(&retry.text) {
                        tracing::info!("fallback answer also reports no information, keeping original");
                    } else {
                        answer = retry.text;
                        used_fallback_llm = true;
                    }
                }
                Err(e) => {
                    // Degrade quietly: the original answer stands.
                    tracing::warn!(error = %e, "fallback model failed, keeping original answer");
                }
            }
        }

        Ok(PipelineResult {
            answer,
            sql_executed: false,
            rag_executed: true,
            sql_query: None,
            rag_metadata: Some(assembled.metadata),
            used_fallback_llm,
            usage,
        })
    }

    fn is_no_information(&self, answer: &str) -> bool {
        let lower = answer.to_lowercase();
        self.config
            .no_info_phrases
            .iter()
            .any(|phrase| lower.contains(phrase.as_str()))
    }
}

fn build_answer_prompt(
    query: &str,
    history: &str,
    context: &str,
    mode: HallucinationMode,
) -> String {
    let mut prompt = String::from(
        "Ти си помощник за система за данни за читалища в България.\n\
         Твоята задача е да отговориш на въпроса на базата на предоставения контекст.\n\
         \n\
         ВАЖНИ ПРАВИЛА:\n\
         1. Разграничавай между факти от базата данни и информация от анализите.\n\
         2. За фактически въпроси (брой, статистика, данни) използвай предимно данните от базата.\n\
         3. За обяснения и контекст можеш да използваш и анализите.\n\
         4. Отговаряй на български език, точно и конкретно.\n",
    );
    prompt.push('\n');
    prompt.push_str(mode_instructions(mode));
    if !history.is_empty() {
        prompt.push_str(&format!("\nКонтекст от предишни съобщения:\n{}\n", history));
    }
    prompt.push_str(&format!("\nКонтекст:\n{}\n\nВъпрос: {}\n\nОтговор:", context, query));
    prompt
}

fn mode_instructions(mode: HallucinationMode) -> &'static str {
    match mode {
        HallucinationMode::Low => {
            "СТРОГИ ПРАВИЛА ЗА ТОЧНОСТ:\n\
             1. Отговаряй СТРОГО на базата на предоставения контекст. Никога не измисляй факти.\n\
             2. Ако информацията не е в контекста, кажи ясно: 'Нямам информация за това в предоставения контекст.'\n\
             3. Не прави предположения, които не са директно подкрепени от контекста.\n"
        }
        HallucinationMode::Medium => {
            "БАЛАНСИРАНИ ПРАВИЛА:\n\
             1. Отговаряй предимно на базата на предоставения контекст.\n\
             2. Можеш да правиш разумни изводи, но ги базирай на контекста.\n\
             3. Ако информацията липсва, кажи честно, но можеш да предложиш общи обяснения.\n"
        }
        HallucinationMode::High => {
            "ГЪВКАВИ ПРАВИЛА:\n\
             1. Използвай контекста като основа, но можеш да правиш разумни изводи.\n\
             2. Ако контекстът не е достатъчен, можеш да допълниш с общи знания, но уточни това.\n"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::providers::testing::{FixedRetriever, ScriptedModel};

    fn retriever() -> FixedRetriever {
        FixedRetriever {
            db: vec![
                FixedRetriever::passage("В Пловдив има 17 читалища.", 0.92),
                FixedRetriever::passage("Читалищата са основани през 19 век.", 0.81),
            ],
            analysis: vec![FixedRetriever::passage(
                "Читалищата играят централна роля в културния живот.",
                0.77,
            )],
        }
    }

    fn pipeline(model: Arc<ScriptedModel>, retriever: FixedRetriever) -> RagPipeline {
        let config = EngineConfig::default();
        let registry = ModelRegistry::new(config.models);
        RagPipeline::new(
            model,
            Arc::new(retriever),
            &registry,
            config.retrieval,
            config.rag,
        )
    }

    #[tokio::test]
    async fn answers_from_retrieved_context() {
        let model = Arc::new(ScriptedModel::new(vec!["Читалището е културна институция."]));
        let rag = pipeline(model.clone(), retriever());

        let result = rag
            .run(
                "Какво е читалище?",
                "",
                HallucinationMode::Medium,
                FallbackPolicy::Enabled,
                None,
            )
            .await
            .unwrap();

        assert!(result.rag_executed);
        assert!(!result.sql_executed);
        assert!(!result.used_fallback_llm);
        assert_eq!(model.call_count(), 1);
        let metadata = result.rag_metadata.unwrap();
        assert_eq!(metadata.db_documents, 2);
        assert_eq!(metadata.analysis_documents, 1);

        // The prompt carried the assembled two-section context.
        let prompt = model.prompts.lock()[0].clone();
        assert!(prompt.contains("ДАННИ ОТ БАЗА ДАННИ"));
        assert!(prompt.contains("АНАЛИЗЕН ДОКУМЕНТ"));
        assert!(prompt.contains("В Пловдив има 17 читалища."));
    }

    #[tokio::test]
    async fn purely_factual_question_skips_analysis_corpus() {
        let model = Arc::new(ScriptedModel::new(vec!["17."]));
        let rag = pipeline(model.clone(), retriever());

        let result = rag
            .run(
                "Колко читалища има в Пловдив?",
                "",
                HallucinationMode::Medium,
                FallbackPolicy::Enabled,
                None,
            )
            .await
            .unwrap();

        let metadata = result.rag_metadata.unwrap();
        assert_eq!(metadata.analysis_documents, 0);
        assert!(!model.prompts.lock()[0].contains("АНАЛИЗЕН ДОКУМЕНТ"));
    }

    #[tokio::test]
    async fn no_information_answer_triggers_exactly_one_fallback() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Нямам информация за тази заявка.",
            "Читалището е културна институция от 19 век.",
        ]));
        let rag = pipeline(model.clone(), retriever());

        let result = rag
            .run(
                "Какво е читалище?",
                "",
                HallucinationMode::Medium,
                FallbackPolicy::Enabled,
                None,
            )
            .await
            .unwrap();

        assert_eq!(model.call_count(), 2);
        assert!(result.used_fallback_llm);
        assert_eq!(result.answer, "Читалището е културна институция от 19 век.");
        // Second call went to the stronger model.
        let models = model.models_used.lock();
        assert_ne!(models[0], models[1]);
    }

    #[tokio::test]
    async fn fallback_never_runs_when_disabled_by_policy() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Нямам информация за тази заявка.",
            "не трябва да се стига дотук",
        ]));
        let rag = pipeline(model.clone(), retriever());

        let result = rag
            .run(
                "Какво е читалище?",
                "",
                HallucinationMode::Medium,
                FallbackPolicy::Disabled,
                None,
            )
            .await
            .unwrap();

        assert_eq!(model.call_count(), 1);
        assert!(!result.used_fallback_llm);
        assert_eq!(result.answer, "Нямам информация за тази заявка.");
    }

    #[tokio::test]
    async fn fallback_that_also_lacks_information_keeps_original() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Нямам информация за тази заявка.",
            "За съжаление не знам нищо по темата.",
        ]));
        let rag = pipeline(model.clone(), retriever());

        let result = rag
            .run(
                "Какво е читалище?",
                "",
                HallucinationMode::Medium,
                FallbackPolicy::Enabled,
                None,
            )
            .await
            .unwrap();

        assert_eq!(model.call_count(), 2);
        assert!(!result.used_fallback_llm);
        assert_eq!(result.answer, "Нямам информация за тази заявка.");
    }

    #[tokio::test]
    async fn fallback_failure_degrades_to_original_answer() {
        // One scripted reply; the retry call finds the script empty and errors.
        let model = Arc::new(ScriptedModel::new(vec!["Нямам информация за тази заявка."]));
        let rag = pipeline(model.clone(), retriever());

        let result = rag
            .run(
                "Какво е читалище?",
                "",
                HallucinationMode::Medium,
                FallbackPolicy::Enabled,
                None,
            )
            .await
            .unwrap();

        assert_eq!(model.call_count(), 2);
        assert!(!result.used_fallback_llm);
        assert_eq!(result.answer, "Нямам информация за тази заявка.");
    }

    #[tokio::test]
    async fn seed_context_appears_before_retrieved_passages() {
        let model = Arc::new(ScriptedModel::new(vec!["Отговор."]));
        let rag = pipeline(model.clone(), retriever());

        rag.run(
            "Разкажи за читалищата в Пловдив.",
            "",
            HallucinationMode::Medium,
            FallbackPolicy::Disabled,
            Some("Резултатът е 17."),
        )
        .await
        .unwrap();

        let prompt = model.prompts.lock()[0].clone();
        let seed_pos = prompt.find("Резултатът е 17.").unwrap();
        let db_pos = prompt.find("ДАННИ ОТ БАЗА ДАННИ").unwrap();
        assert!(seed_pos < db_pos);
    }

    #[tokio::test]
    async fn mode_steers_temperature_and_instructions() {
        let model = Arc::new(ScriptedModel::new(vec!["Отговор.", "Отговор."]));
        let rag = pipeline(model.clone(), retriever());

        rag.run("Какво е читалище?", "", HallucinationMode::Low, FallbackPolicy::Disabled, None)
            .await
            .unwrap();
        rag.run("Какво е читалище?", "", HallucinationMode::High, FallbackPolicy::Disabled, None)
            .await
            .unwrap();

        let prompts = model.prompts.lock();
        assert!(prompts[0].contains("СТРОГИ ПРАВИЛА ЗА ТОЧНОСТ"));
        assert!(prompts[1].contains("ГЪВКАВИ ПРАВИЛА"));
        let temps = model.temperatures.lock();
        assert_eq!(temps[0], 0.0);
        assert_eq!(temps[1], 0.7);
    }
}
