//! Deterministic context assembly for generation.
//!
//! Database-derived passages are authoritative for facts and always come
//! first; analysis-document passages follow for explanatory color and can
//! never displace a database fact. Within a section, passages keep their
//! retrieval rank. The assembled text is capped at a fixed budget.

use crate::providers::ScoredPassage;
use crate::types::RetrievalMetadata;

pub struct AssembledContext {
    pub text: String,
    pub metadata: RetrievalMetadata,
}

/// Build the generation context. `seed` (e.g. a SQL narrative) is placed
/// ahead of everything retrieved.
pub fn assemble(
    db: &[ScoredPassage],
    analysis: &[ScoredPassage],
    seed: Option<&str>,
    budget_chars: usize,
) -> AssembledContext {
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0usize;
    let mut db_included = 0usize;
    let mut analysis_included = 0usize;

    let mut push_within_budget = |parts: &mut Vec<String>, used: &mut usize, block: String| -> bool {
        if *used + block.len() > budget_chars {
            return false;
        }
        *used += block.len();
        parts.push(block);
        true
    };

    if let Some(seed) = seed {
        // The seed is authoritative; it is never dropped for budget reasons.
        let block = format!("=== РЕЗУЛТАТИ ОТ БАЗА ДАННИ ===\n{}\n", seed);
        used += block.len();
        parts.push(block);
    }

    if !db.is_empty() {
        push_within_budget(&mut parts, &mut used, "=== ДАННИ ОТ БАЗА ДАННИ ===\n".into());
        for (i, passage) in db.iter().enumerate() {
            let block = format!("[Документ {}]\n{}\n", i + 1, passage.text);
            if !push_within_budget(&mut parts, &mut used, block) {
                break;
            }
            db_included += 1;
        }
    }

    if !analysis.is_empty() {
        push_within_budget(&mut parts, &mut used, "\n=== АНАЛИЗЕН ДОКУМЕНТ ===\n".into());
        for (i, passage) in analysis.iter().enumerate() {
            let block = format!("[Анализ {}]\n{}\n", i + 1, passage.text);
            if !push_within_budget(&mut parts, &mut used, block) {
                break;
            }
            analysis_included += 1;
        }
    }

    let text = if parts.is_empty() {
        "Няма налична информация за тази заявка.".to_string()
    } else {
        parts.join("\n")
    };

    AssembledContext {
        text,
        metadata: RetrievalMetadata {
            db_documents: db_included,
            analysis_documents: analysis_included,
            total_documents: db_included + analysis_included,
        },
    }
}
