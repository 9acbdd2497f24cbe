//! Rule-based intent signal from Bulgarian keyword matching.
//!
//! Numeric/statistical phrasing votes for the SQL pipeline, descriptive
//! phrasing for retrieval. No rule firing means no signal.

use crate::types::{Intent, Signal};

/// Keywords that indicate numeric / aggregation queries.
const SQL_KEYWORDS: &[&str] = &[
    // Counting and aggregation
    "колко",
    "брой",
    "броя",
    "броят",
    "общо",
    "сума",
    "сумата",
    "сбор",
    // Statistical operations
    "средно",
    "средната",
    "средният",
    "среден",
    "максимум",
    "максимално",
    "минимум",
    "минимално",
    "процент",
    "проценти",
    // Distribution and grouping
    "разпределение",
    "разпределението",
    "групиране",
    "по регион",
    "по град",
    "по статус",
    "по година",
    // List and table requests
    "списък",
    "списъка",
    "таблица",
    "таблицата",
    "графика",
    // Ranking and comparison
    "топ",
    "най-много",
    "най-малко",
    "най-голям",
    "най-голяма",
    "най-малък",
    "сравнение",
    "сравни",
    // Statistical terms
    "статистика",
    "статистиката",
    "данни",
    "данните",
];

/// Keywords that indicate descriptive / explanatory queries.
const RAG_KEYWORDS: &[&str] = &[
    // Question words
    "какво",
    "какво е",
    "какво представлява",
    "как",
    "как се",
    "защо",
    "къде",
    "кога",
    "кой",
    "коя",
    "кое",
    "кои",
    // Descriptive requests
    "опиши",
    "описание",
    "описанието",
    "разкажи",
    "разказ",
    // Information requests
    "информация",
    "информацията",
    "информация за",
    "детайли",
    "подробности",
    // Contextual questions
    "история",
    "историята",
    "история на",
    "контекст",
    "обяснение",
    "обясни",
    // General knowledge
    "какво знаеш",
    "разкажи за",
    "разкажи ми за",
];

/// Connectives that suggest a query combining both kinds of content.
const HYBRID_INDICATORS: &[&str] = &[
    "също",
    "освен това",
    "допълнително",
    "плюс",
    "както и",
    "включително",
    "заедно с",
];

pub struct RuleOutcome {
    pub signal: Signal,
    pub matched: Vec<String>,
}

/// Classify a query from keyword matches alone. `None` when no rule fires.
pub fn classify(query: &str) -> Option<RuleOutcome> {
    let lower = query.to_lowercase();
    let lower = lower.trim();
    if lower.is_empty() {
        return None;
    }

    let sql_hits = matches_in(lower, SQL_KEYWORDS);
    let rag_hits = matches_in(lower, RAG_KEYWORDS);
    if sql_hits.is_empty() && rag_hits.is_empty() {
        return None;
    }

    let words = lower.split_whitespace().count();
    let sql_score = score(sql_hits.len(), words);
    let rag_score = score(rag_hits.len(), words);
    let has_connective = HYBRID_INDICATORS.iter().any(|kw| lower.contains(kw));

    let (intent, confidence) = match (sql_hits.is_empty(), rag_hits.is_empty()) {
        (false, true) => (Intent::Sql, sql_score),
        (true, false) => (Intent::Rag, rag_score),
        (false, false) => {
            if has_connective {
                (Intent::Hybrid, ((sql_score + rag_score) / 2.0).min(0.9))
            } else if (sql_score - rag_score).abs() < 0.2 {
                (Intent::Hybrid, (sql_score + rag_score) / 2.0)
            } else if sql_score > rag_score {
                (Intent::Sql, sql_score)
            } else {
                (Intent::Rag, rag_score)
            }
        }
        (true, true) => unreachable!("handled by the empty check above"),
    };

    let mut matched: Vec<String> = sql_hits
        .iter()
        .take(3)
        .map(|kw| format!("SQL: {}", kw))
        .collect();
    matched.extend(rag_hits.iter().take(3).map(|kw| format!("RAG: {}", kw)));

    Some(RuleOutcome {
        signal: Signal {
            intent,
            // Leave headroom for the model signal.
            confidence: confidence.min(0.95),
        },
        matched,
    })
}

/// A question is purely factual when only numeric keywords fire. Used to
/// decide whether the analysis corpus joins retrieval at all.
pub fn is_purely_factual(query: &str) -> bool {
    let lower = query.to_lowercase();
    !matches_in(&lower, SQL_KEYWORDS).is_empty() && matches_in(&lower, RAG_KEYWORDS).is_empty()
}

fn matches_in<'a>(query: &str, keywords: &[&'a str]) -> Vec<&'a str> {
    keywords
        .iter()
        .filter(|kw| query.contains(*kw))
        .copied()
        .collect()
}

/// More matches raise confidence (capped at three); long queries lower it,
/// since keywords match them by chance more easily.
fn score(matches: usize, words: usize) -> f32 {
    if matches == 0 {
        return 0.0;
    }
    let match_score = (matches as f32 / 3.0).min(1.0);
    let length_factor = match words {
        0..=3 => 1.0,
        4..=6 => 0.9,
        7..=10 => 0.8,
        _ => 0.7,
    };
    match_score * length_factor
}
