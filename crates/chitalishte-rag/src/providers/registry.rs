//! Task-based model selection.
//!
//! Different tasks want different models: a fast, deterministic one for
//! intent classification, the standard one for answer generation, and a
//! stronger one for the no-information retry.

use crate::config::ModelsConfig;

use super::GenerationOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Classification,
    Generation,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: ModelsConfig,
}

impl ModelRegistry {
    pub fn new(models: ModelsConfig) -> Self {
        Self { models }
    }

    /// Options for a task at the task's default temperature.
    pub fn options(&self, task: Task) -> GenerationOptions {
        let entry = match task {
            Task::Classification => &self.models.classification,
            Task::Generation => &self.models.generation,
            Task::Fallback => &self.models.fallback,
        };
        GenerationOptions {
            model_id: entry.model_id.clone(),
            temperature: entry.temperature,
            max_tokens: self.models.max_tokens,
        }
    }

    /// Options for a task with the temperature overridden, e.g. by the
    /// hallucination mode.
    pub fn options_with_temperature(&self, task: Task, temperature: f32) -> GenerationOptions {
        GenerationOptions {
            temperature,
            ..self.options(task)
        }
    }
}
