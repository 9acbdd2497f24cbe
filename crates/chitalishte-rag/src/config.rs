use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub abuse: AbuseConfig,
    pub routing: RoutingConfig,
    pub retrieval: RetrievalConfig,
    pub rag: RagConfig,
    pub sql: SqlConfig,
    pub models: ModelsConfig,
    pub conversation: ConversationConfig,
    pub cost: CostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    /// How often the background task prunes stale counter state.
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    pub enabled: bool,
    pub max_query_length: usize,
    /// Same-IP requests closer together than this are treated as abuse.
    pub min_request_interval_ms: u64,
    /// Burst ceiling within `rapid_window_secs`.
    pub max_rapid_requests: usize,
    pub rapid_window_secs: u64,
    pub block_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Rule confidence at or above this is trusted when the model agrees.
    pub high_confidence: f32,
    /// Disagreeing signals within this tolerance of each other route to hybrid.
    pub tie_tolerance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub db_top_k: usize,
    pub analysis_top_k: usize,
    /// Assembled context is truncated to this many characters.
    pub context_budget_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Retry once with the fallback model when the answer matches a
    /// no-information phrase. Standalone RAG only.
    pub enable_fallback: bool,
    /// Bulgarian phrases that mark an answer as "no information". A
    /// heuristic, kept as configuration rather than a hard invariant.
    pub no_info_phrases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    /// Static description of the queryable schema, interpolated into the
    /// generation prompt. Not re-derived at runtime.
    pub schema_description: String,
    /// How many rows the narrative quotes before summarizing.
    pub max_rows_in_narrative: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub classification: ModelEntry,
    pub generation: ModelEntry,
    /// Stronger model used for the single no-information retry.
    pub fallback: ModelEntry,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Read window: how many recent messages feed the prompt context.
    /// Full history is retained regardless.
    pub context_window_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl EngineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_limit.per_minute == 0 {
            return Err("rate_limit.per_minute must be > 0".into());
        }
        if self.rate_limit.per_hour < self.rate_limit.per_minute {
            return Err("rate_limit.per_hour must be >= per_minute".into());
        }
        if self.rate_limit.per_day < self.rate_limit.per_hour {
            return Err("rate_limit.per_day must be >= per_hour".into());
        }
        if self.abuse.max_query_length == 0 {
            return Err("abuse.max_query_length must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.routing.high_confidence) {
            return Err("routing.high_confidence must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.routing.tie_tolerance) {
            return Err("routing.tie_tolerance must be in [0.0, 1.0]".into());
        }
        if self.retrieval.db_top_k == 0 {
            return Err("retrieval.db_top_k must be > 0".into());
        }
        if self.retrieval.context_budget_chars < 500 {
            return Err("retrieval.context_budget_chars must be >= 500".into());
        }
        if self.models.max_tokens == 0 {
            return Err("models.max_tokens must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, validating before returning.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment-variable overrides applied, using the
    /// variable names of the deployed service.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<bool>("RATE_LIMIT_ENABLED") {
            config.rate_limit.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_LIMIT_PER_MINUTE") {
            config.rate_limit.per_minute = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_LIMIT_PER_HOUR") {
            config.rate_limit.per_hour = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_LIMIT_PER_DAY") {
            config.rate_limit.per_day = v;
        }
        if let Some(v) = env_parse::<bool>("ABUSE_PROTECTION_ENABLED") {
            config.abuse.enabled = v;
        }
        if let Some(v) = env_parse::<usize>("ABUSE_MAX_QUERY_LENGTH") {
            config.abuse.max_query_length = v;
        }
        if let Some(v) = env_parse::<bool>("RAG_ENABLE_FALLBACK") {
            config.rag.enable_fallback = v;
        }
        if let Ok(v) = std::env::var("OPENAI_CHAT_MODEL") {
            if !v.is_empty() {
                config.models.generation.model_id = v.clone();
                config.models.classification.model_id = v;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_CHAT_MODEL_FALLBACK") {
            if !v.is_empty() {
                config.models.fallback.model_id = v;
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                enabled: true,
                per_minute: 5,
                per_hour: 40,
                per_day: 200,
                cleanup_interval_secs: 3600,
            },
            abuse: AbuseConfig {
                enabled: true,
                max_query_length: 10_000,
                min_request_interval_ms: 500,
                max_rapid_requests: 10,
                rapid_window_secs: 5,
                block_duration_secs: 3600,
            },
            routing: RoutingConfig {
                high_confidence: 0.8,
                tie_tolerance: 0.15,
            },
            retrieval: RetrievalConfig {
                db_top_k: 4,
                analysis_top_k: 2,
                context_budget_chars: 6000,
            },
            rag: RagConfig {
                enable_fallback: true,
                no_info_phrases: vec![
                    "нямам информация".into(),
                    "нямам данни".into(),
                    "не мога да намеря".into(),
                    "не мога да отговоря".into(),
                    "не знам".into(),
                    "не съм сигурен".into(),
                    "липсва информация".into(),
                ],
            },
            sql: SqlConfig {
                schema_description: "\
Таблица chitalishte: id, name, town, region, status, founded_year, members_count.\n\
Таблица information_card: id, chitalishte_id, year, activities, library_volumes, subsidy.\n\
Връзка: chitalishte.id = information_card.chitalishte_id."
                    .into(),
                max_rows_in_narrative: 5,
            },
            models: ModelsConfig {
                classification: ModelEntry {
                    model_id: "gpt-4o-mini".into(),
                    temperature: 0.0,
                },
                generation: ModelEntry {
                    model_id: "gpt-4o-mini".into(),
                    temperature: 0.0,
                },
                fallback: ModelEntry {
                    model_id: "gpt-4o".into(),
                    temperature: 0.0,
                },
                max_tokens: 1024,
            },
            conversation: ConversationConfig {
                context_window_messages: 10,
            },
            cost: CostConfig {
                input_per_1k: 0.00015,
                output_per_1k: 0.0006,
            },
        }
    }
}
