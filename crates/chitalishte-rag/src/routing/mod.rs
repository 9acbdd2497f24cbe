//! Query intent classification.
//!
//! Two independent signals, Bulgarian keyword rules and a model
//! classification call, are combined by a pure function into one final
//! decision. Identical inputs always produce the identical decision, and
//! every decision carries an explanation naming the winning signal.

pub mod model;
pub mod rules;

use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::providers::registry::{ModelRegistry, Task};
use crate::providers::{ChatModel, GenerationOptions};
use crate::types::{Intent, IntentDecision, Signal};

pub struct IntentRouter {
    model: Arc<dyn ChatModel>,
    options: GenerationOptions,
    config: RoutingConfig,
}

impl IntentRouter {
    pub fn new(model: Arc<dyn ChatModel>, registry: &ModelRegistry, config: RoutingConfig) -> Self {
        Self {
            model,
            options: registry.options(Task::Classification),
            config,
        }
    }

    /// Run both signals and combine them. A failed model call degrades to
    /// the rule signal alone and is never surfaced as an error.
    pub async fn classify(&self, query: &str, history: &str) -> IntentDecision {
        let rule = rules::classify(query);

        let model_outcome = match model::classify(self.model.as_ref(), &self.options, query, history).await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "model intent signal failed, deciding from rules alone");
                None
            }
        };

        let matched_rules = rule.as_ref().map(|r| r.matched.clone()).unwrap_or_default();
        let decision = combine(
            rule.map(|r| r.signal),
            model_outcome.map(|m| m.signal),
            &self.config,
            matched_rules,
        );

        tracing::info!(
            intent = decision.intent.as_str(),
            confidence = decision.confidence,
            explanation = %decision.explanation,
            "routing decision"
        );
        decision
    }
}

/// Pure combination of the two signals. The hybrid fallback exists so an
/// ambiguous query never wrongly excludes a pipeline it may need.
pub fn combine(
    rule: Option<Signal>,
    model: Option<Signal>,
    config: &RoutingConfig,
    matched_rules: Vec<String>,
) -> IntentDecision {
    let (intent, confidence, explanation) = match (rule, model) {
        (None, None) => (
            Intent::Hybrid,
            0.0,
            "Няма нито правилов, нито моделен сигнал - използва се хибриден режим.".to_string(),
        ),
        (Some(r), None) => (
            r.intent,
            r.confidence,
            format!(
                "Моделният класификатор е недостъпен. Използва се правиловият сигнал '{}' (увереност {:.0}%).",
                r.intent.as_str(),
                r.confidence * 100.0
            ),
        ),
        (None, Some(m)) => (
            m.intent,
            m.confidence,
            format!(
                "Не са открити ключови думи. Използва се моделният сигнал '{}' (увереност {:.0}%).",
                m.intent.as_str(),
                m.confidence * 100.0
            ),
        ),
        (Some(r), Some(m)) if r.intent == m.intent => {
            if r.confidence >= config.high_confidence {
                (
                    r.intent,
                    r.confidence.max(m.confidence),
                    format!(
                        "Правиловият сигнал е силен и моделът е съгласен за '{}' (правила {:.0}%, модел {:.0}%).",
                        r.intent.as_str(),
                        r.confidence * 100.0,
                        m.confidence * 100.0
                    ),
                )
            } else {
                let combined = (r.confidence * 0.4 + m.confidence * 0.6).min(0.95);
                (
                    r.intent,
                    combined,
                    format!(
                        "И двата класификатора са съгласни за '{}' (правила {:.0}%, модел {:.0}%, комбинирана {:.0}%).",
                        r.intent.as_str(),
                        r.confidence * 100.0,
                        m.confidence * 100.0,
                        combined * 100.0
                    ),
                )
            }
        }
        (Some(r), Some(m)) => {
            if (r.confidence - m.confidence).abs() <= config.tie_tolerance {
                (
                    Intent::Hybrid,
                    (r.confidence + m.confidence) / 2.0,
                    format!(
                        "Сигналите не са съгласни с близки уверености (правила '{}' {:.0}%, модел '{}' {:.0}%) - използва се хибриден режим като безопасен избор.",
                        r.intent.as_str(),
                        r.confidence * 100.0,
                        m.intent.as_str(),
                        m.confidence * 100.0
                    ),
                )
            } else if r.confidence > m.confidence {
                (
                    r.intent,
                    r.confidence,
                    format!(
                        "Сигналите не са съгласни. Правиловият '{}' ({:.0}%) печели над моделния '{}' ({:.0}%).",
                        r.intent.as_str(),
                        r.confidence * 100.0,
                        m.intent.as_str(),
                        m.confidence * 100.0
                    ),
                )
            } else {
                (
                    m.intent,
                    m.confidence,
                    format!(
                        "Сигналите не са съгласни. Моделният '{}' ({:.0}%) печели над правиловия '{}' ({:.0}%).",
                        m.intent.as_str(),
                        m.confidence * 100.0,
                        r.intent.as_str(),
                        r.confidence * 100.0
                    ),
                )
            }
        }
    };

    IntentDecision {
        intent,
        confidence,
        rule,
        model,
        matched_rules,
        explanation,
    }
}
