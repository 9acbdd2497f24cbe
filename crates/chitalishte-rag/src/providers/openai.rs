//! OpenAI-compatible chat-completions provider.
//!
//! Covers the hosted OpenAI API and local OpenAI-compatible endpoints
//! (TGI, Ollama and similar); the endpoint URL is the only difference.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{ChatModel, Generation, GenerationOptions};

pub struct OpenAiCompatible {
    endpoint: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatible {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(120))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Hosted OpenAI endpoint.
    pub fn openai(api_key: impl Into<String>) -> Result<Self> {
        Self::new("https://api.openai.com/v1/chat/completions", api_key)
    }

    /// Local TGI container; no auth required.
    pub fn tgi(base_url: &str) -> Result<Self> {
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Self::new(endpoint, "not-needed")
    }

    /// Parse a response body as JSON, returning a clear error if the server
    /// returned HTML (e.g. a gateway error page) instead of valid JSON.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;

        let trimmed = body.trim_start();
        if trimmed.starts_with('<') || trimmed.starts_with("<!") {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(anyhow!(
                "Endpoint {} returned HTML instead of JSON (HTTP {}) — the service may be down or misconfigured. Response: {}",
                endpoint, status, preview
            ));
        }

        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!(
                "Failed to parse JSON from {} (HTTP {}): {}. Response body: {}",
                endpoint,
                status,
                e,
                preview
            )
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatible {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<Generation> {
        let request = json!({
            "model": options.model_id,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "stream": false
        });

        tracing::debug!(
            endpoint = %self.endpoint,
            model = %options.model_id,
            prompt_len = prompt.len(),
            "Sending chat-completions request"
        );

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!(
                        "Request to {} timed out — check network connectivity",
                        self.endpoint
                    )
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {}: {}", self.endpoint, e)
                } else {
                    anyhow!("Request to {} failed: {}", self.endpoint, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            tracing::error!(endpoint = %self.endpoint, status = %status, error = %error, "API returned error");
            return Err(anyhow!("API error ({}): {}", status, error));
        }

        let result: CompletionResponse =
            Self::parse_json_response(response, &self.endpoint).await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No choices returned from API"))?;

        let usage = result.usage.unwrap_or_default();
        Ok(Generation {
            text: choice.message.content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            latency_ms,
        })
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}
