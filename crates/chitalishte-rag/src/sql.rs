//! SQL pipeline: natural language to a validated read-only query.
//!
//! The model proposes a statement against the static schema description;
//! nothing reaches the store without passing the safety gate. Rejected
//! statements are kept in the audit log and never shown to the user.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::SqlConfig;
use crate::error::EngineError;
use crate::providers::registry::{ModelRegistry, Task};
use crate::providers::{ChatModel, GenerationOptions, SqlRows, SqlStore};
use crate::types::{HallucinationMode, PipelineResult, TokenUsage};

static SQL_STATEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\b(SELECT|WITH)\b.*?(;|\z)").expect("sql statement regex is valid")
});
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));
/// Statements containing any of these verbs never execute.
static DANGEROUS_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(INSERT|UPDATE|DELETE|DROP|ALTER|TRUNCATE|CREATE|GRANT|REVOKE|EXEC|EXECUTE)\b")
        .expect("keyword regex is valid")
});

pub struct SqlPipeline {
    model: Arc<dyn ChatModel>,
    store: Arc<dyn SqlStore>,
    options: GenerationOptions,
    config: SqlConfig,
}

impl SqlPipeline {
    pub fn new(
        model: Arc<dyn ChatModel>,
        store: Arc<dyn SqlStore>,
        registry: &ModelRegistry,
        config: SqlConfig,
    ) -> Self {
        Self {
            model,
            store,
            options: registry.options(Task::Generation),
            config,
        }
    }

    /// Answer a numeric/statistical question, or report why it cannot be
    /// answered. The executed statement is recorded for audit.
    pub async fn run(
        &self,
        query: &str,
        history: &str,
        mode: HallucinationMode,
    ) -> Result<PipelineResult, EngineError> {
        let prompt = build_generation_prompt(query, history, &self.config.schema_description, mode);
        let generation = self
            .model
            .generate(&prompt, &self.options)
            .await
            .map_err(EngineError::UpstreamModelUnavailable)?;

        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
        });

        let statement = extract_statement(&generation.text).ok_or_else(|| {
            tracing::warn!(query, raw = %generation.text, "no SQL statement in model output");
            EngineError::SqlGenerationFailed
        })?;

        if let Err(reason) = validate(&statement) {
            tracing::warn!(query, statement = %statement, reason = %reason, "unsafe SQL rejected");
            return Err(EngineError::SqlUnsafe { reason, statement });
        }
        let statement = sanitize(&statement);

        let rows = self
            .store
            .execute_readonly(&statement)
            .await
            .map_err(EngineError::SqlExecutionFailed)?;

        tracing::info!(
            query,
            statement = %statement,
            row_count = rows.rows.len(),
            "sql query executed"
        );

        Ok(PipelineResult {
            answer: narrate(&rows, self.config.max_rows_in_narrative),
            sql_executed: true,
            rag_executed: false,
            sql_query: Some(statement),
            rag_metadata: None,
            used_fallback_llm: false,
            usage,
        })
    }
}

fn build_generation_prompt(
    query: &str,
    history: &str,
    schema: &str,
    mode: HallucinationMode,
) -> String {
    let mut prompt = format!(
        "Ти си SQL асистент за база данни за читалища в България.\n\
         Генерирай ЕДНА SELECT заявка, която отговаря на въпроса на потребителя.\n\
         \n\
         ВАЖНИ ПРАВИЛА:\n\
         1. Генерирай САМО SELECT заявки. Никога не използвай DELETE, UPDATE, INSERT, DROP или други модифициращи команди.\n\
         2. Използвай само описаната схема и бъди точен с имената на колоните.\n\
         3. За агрегации използвай COUNT, SUM, AVG, MIN, MAX; за статистики - GROUP BY.\n\
         4. Върни само SQL заявката, без обяснения.\n\
         \n\
         Схема:\n{}\n",
        schema
    );
    prompt.push('\n');
    prompt.push_str(sql_mode_instructions(mode));
    if !history.is_empty() {
        prompt.push_str(&format!("\nКонтекст от разговора:\n{}\n", history));
    }
    prompt.push_str(&format!("\nВъпрос: {}\nSQL:", query));
    prompt
}

fn sql_mode_instructions(mode: HallucinationMode) -> &'static str {
    match mode {
        HallucinationMode::Low => {
            "СТРОГИ ПРАВИЛА ЗА SQL:\n\
             1. Генерирай само заявки, които са напълно коректни спрямо схемата.\n\
             2. Ако не си сигурен в структурата, не генерирай заявка."
        }
        HallucinationMode::Medium => {
            "БАЛАНСИРАНИ ПРАВИЛА ЗА SQL:\n\
             1. Генерирай коректни заявки спрямо схемата.\n\
             2. При съмнение избери по-простата заявка."
        }
        HallucinationMode::High => {
            "ГЪВКАВИ ПРАВИЛА ЗА SQL:\n\
             1. Генерирай логична и полезна заявка, дори при непълна сигурност."
        }
    }
}

/// Pull the first SELECT/WITH statement out of the model's reply,
/// tolerating markdown fences and surrounding prose.
pub fn extract_statement(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    SQL_STATEMENT_RE
        .find(cleaned)
        .map(|m| m.as_str().trim().to_string())
}

/// Safety gate: read-only, single statement, no mutating verbs.
pub fn validate(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err("empty statement".into());
    }

    let upper = trimmed.to_uppercase();
    if let Some(hit) = DANGEROUS_KEYWORD_RE.find(&upper) {
        return Err(format!("mutating keyword {} is not allowed", hit.as_str()));
    }

    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return Err("statement must start with SELECT or WITH".into());
    }

    // One read statement per turn: a semicolon may only terminate it.
    if let Some(pos) = trimmed.find(';') {
        if !trimmed[pos + 1..].trim().is_empty() {
            return Err("multiple statements are not allowed".into());
        }
    }

    if trimmed.matches("--").count() > 2 || trimmed.matches("/*").count() > 1 {
        return Err("excessive comments".into());
    }

    Ok(())
}

fn sanitize(sql: &str) -> String {
    let without_terminator = sql.trim().trim_end_matches(';');
    WHITESPACE_RE
        .replace_all(without_terminator, " ")
        .trim()
        .to_string()
}

/// Turn a row set into short Bulgarian prose plus a bounded preview.
fn narrate(rows: &SqlRows, max_rows: usize) -> String {
    if rows.rows.is_empty() {
        return "Заявката не върна резултати.".to_string();
    }

    // Single scalar: answer with the value itself.
    if rows.rows.len() == 1 && rows.rows[0].len() == 1 {
        return format!("Резултатът е {}.", rows.rows[0][0]);
    }

    let mut narrative = format!(
        "Заявката върна {} реда (колони: {}).",
        rows.rows.len(),
        rows.columns.join(", ")
    );
    for row in rows.rows.iter().take(max_rows) {
        let line = rows
            .columns
            .iter()
            .zip(row.iter())
            .map(|(col, val)| format!("{}: {}", col, val))
            .collect::<Vec<_>>()
            .join(", ");
        narrative.push_str("\n- ");
        narrative.push_str(&line);
    }
    if rows.rows.len() > max_rows {
        narrative.push_str(&format!("\n... и още {} реда.", rows.rows.len() - max_rows));
    }
    narrative
}
