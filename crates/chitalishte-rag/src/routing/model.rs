//! Model-based intent signal.
//!
//! A single short classification call constrained to return JSON with the
//! intent, a confidence and a one-line reason. Handles common model
//! quirks (markdown fences, trailing prose); anything that does not
//! resolve to a valid intent is a classifier failure and the caller falls
//! back to the rule signal.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::providers::{ChatModel, GenerationOptions};
use crate::types::{Intent, Signal};

const CLASSIFIER_PROMPT: &str = r#"Ти си класификатор на потребителски заявки за система за данни за читалища.
Класифицирай всяка заявка в една от следните категории:
1) 'sql' – когато потребителят иска числа, статистики, агрегати, брой, средно, максимум,
   минимум, проценти, разпределения, таблици, списъци, "топ" класации и др.
2) 'rag' – когато потребителят иска описателна текстова информация, обяснения,
   история, контекст, "какво е", "как се", "защо", "разкажи" и др.
3) 'hybrid' – когато заявката ясно комбинира и двете: иска и числа/статистика,
   и описателен текст (напр. "Колко читалища има и разкажи за тях").

Винаги връщай валиден JSON обект със следната структура:
{
  "intent": "sql" | "rag" | "hybrid",
  "confidence": число между 0.0 и 1.0,
  "reason": "кратко обяснение на български (1-2 изречения)"
}

Правила за confidence:
  * 0.8-1.0, ако си силно уверен
  * 0.5-0.8, ако си умерено уверен
  * под 0.5, ако заявката е неясна или гранична

Бъди стриктен и не измисляй други стойности за intent."#;

pub struct ModelOutcome {
    pub signal: Signal,
    pub reason: String,
}

fn build_prompt(query: &str, history: &str) -> String {
    let mut parts = vec![CLASSIFIER_PROMPT.to_string()];
    if !history.is_empty() {
        parts.push(format!("\nКонтекст от разговора:\n{}", history));
    }
    parts.push(format!(
        "\nКласифицирай следната заявка и върни само валиден JSON:\n\nЗаявка: \"{}\"",
        query
    ));
    parts.join("\n")
}

/// Classify with the model. `Err` means the signal is unusable and the
/// caller must decide without it.
pub async fn classify(
    model: &dyn ChatModel,
    options: &GenerationOptions,
    query: &str,
    history: &str,
) -> Result<ModelOutcome> {
    let prompt = build_prompt(query, history);
    let generation = model
        .generate(&prompt, options)
        .await
        .context("intent classification call failed")?;

    let outcome = parse_classification(&generation.text)?;

    tracing::debug!(
        intent = outcome.signal.intent.as_str(),
        confidence = outcome.signal.confidence,
        latency_ms = generation.latency_ms,
        "model intent signal"
    );

    Ok(outcome)
}

#[derive(Deserialize)]
struct RawClassification {
    intent: String,
    confidence: f32,
    #[serde(default)]
    reason: String,
}

/// Parse the model's JSON reply. Tolerates fences and surrounding prose;
/// rejects out-of-enum intents and out-of-range confidences.
pub fn parse_classification(raw: &str) -> Result<ModelOutcome> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json_str = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => cleaned,
    };

    let parsed: RawClassification = serde_json::from_str(json_str)
        .map_err(|e| anyhow!("classifier returned malformed JSON: {}", e))?;

    let intent = match parsed.intent.to_lowercase().as_str() {
        "sql" => Intent::Sql,
        "rag" => Intent::Rag,
        "hybrid" => Intent::Hybrid,
        other => return Err(anyhow!("classifier returned unknown intent '{}'", other)),
    };

    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(anyhow!(
            "classifier confidence {} outside [0, 1]",
            parsed.confidence
        ));
    }

    Ok(ModelOutcome {
        signal: Signal {
            intent,
            confidence: parsed.confidence,
        },
        reason: parsed.reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let raw = r#"{"intent":"sql","confidence":0.9,"reason":"Пита за брой."}"#;
        let outcome = parse_classification(raw).unwrap();
        assert_eq!(outcome.signal.intent, Intent::Sql);
        assert_eq!(outcome.signal.confidence, 0.9);
    }

    #[test]
    fn parses_fenced_json_with_trailing_text() {
        let raw = "```json\n{\"intent\":\"rag\",\"confidence\":0.7,\"reason\":\"Описателен въпрос.\"}\n```\nНадявам се, че помага!";
        let outcome = parse_classification(raw).unwrap();
        assert_eq!(outcome.signal.intent, Intent::Rag);
    }

    #[test]
    fn rejects_unknown_intent() {
        let raw = r#"{"intent":"graphql","confidence":0.9,"reason":"?"}"#;
        assert!(parse_classification(raw).is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let raw = r#"{"intent":"sql","confidence":1.4,"reason":"?"}"#;
        assert!(parse_classification(raw).is_err());
    }

    #[test]
    fn rejects_free_text() {
        assert!(parse_classification("Не разбирам формата.").is_err());
    }

    #[test]
    fn prompt_includes_history_only_when_present() {
        let with = build_prompt("Колко са?", "Потребител: Разкажи за Пловдив");
        let without = build_prompt("Колко са?", "");
        assert!(with.contains("Контекст от разговора"));
        assert!(!without.contains("Контекст от разговора"));
    }
}
