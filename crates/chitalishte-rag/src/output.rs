//! Structured output formatting.
//!
//! Rule-based post-formatting of the final answer into a markdown table,
//! a bullet summary or an extracted-statistics block. The raw answer is
//! what goes into conversation history; the formatted variant only
//! travels in the response.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::types::OutputFormat;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("number regex is valid"));

/// Format `answer` as requested. `None` for plain text.
pub fn format(answer: &str, format: OutputFormat) -> Option<Value> {
    match format {
        OutputFormat::Text => None,
        OutputFormat::Table => Some(as_table(answer)),
        OutputFormat::Bullets => Some(as_bullets(answer)),
        OutputFormat::Statistics => Some(as_statistics(answer)),
    }
}

/// Rows shaped like `- колона: стойност, колона: стойност` (the SQL
/// narrative preview) become a markdown table; anything else is returned
/// as-is with a note.
fn as_table(answer: &str) -> Value {
    let rows: Vec<Vec<(String, String)>> = answer
        .lines()
        .filter_map(|line| {
            let line = line.strip_prefix("- ")?;
            let pairs: Vec<(String, String)> = line
                .split(", ")
                .filter_map(|pair| {
                    let (key, value) = pair.split_once(": ")?;
                    Some((key.trim().to_string(), value.trim().to_string()))
                })
                .collect();
            if pairs.is_empty() {
                None
            } else {
                Some(pairs)
            }
        })
        .collect();

    if rows.is_empty() {
        return json!({
            "format": "table",
            "formatted_answer": answer,
            "note": "Отговорът не съдържа таблични данни и е върнат като текст.",
        });
    }

    let headers: Vec<&String> = rows[0].iter().map(|(k, _)| k).collect();
    let mut table = format!(
        "| {} |\n|{}|",
        headers
            .iter()
            .map(|h| h.as_str())
            .collect::<Vec<_>>()
            .join(" | "),
        headers.iter().map(|_| "---").collect::<Vec<_>>().join("|")
    );
    for row in &rows {
        let cells: Vec<&str> = headers
            .iter()
            .map(|h| {
                row.iter()
                    .find(|(k, _)| k == *h)
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("")
            })
            .collect();
        table.push_str(&format!("\n| {} |", cells.join(" | ")));
    }

    json!({
        "format": "table",
        "formatted_answer": table,
        "row_count": rows.len(),
    })
}

fn as_bullets(answer: &str) -> Value {
    let bullets: Vec<String> = answer
        .split(['\n', '.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("- {}", s.trim_start_matches("- ")))
        .collect();

    if bullets.is_empty() {
        return json!({ "format": "bullets", "formatted_answer": answer });
    }

    json!({
        "format": "bullets",
        "formatted_answer": bullets.join("\n"),
        "bullet_count": bullets.len(),
    })
}

fn as_statistics(answer: &str) -> Value {
    let numbers: Vec<&str> = NUMBER_RE.find_iter(answer).map(|m| m.as_str()).collect();

    if numbers.is_empty() {
        return json!({
            "format": "statistics",
            "formatted_answer": answer,
            "note": "Отговорът не съдържа числови данни.",
        });
    }

    let formatted = format!(
        "Статистика:\n{}\n\nИзточник: {}",
        numbers
            .iter()
            .map(|n| format!("- {}", n))
            .collect::<Vec<_>>()
            .join("\n"),
        answer
    );
    json!({
        "format": "statistics",
        "formatted_answer": formatted,
        "values": numbers,
    })
}
