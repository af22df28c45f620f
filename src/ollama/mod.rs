//! Ollama integration for local LLM summarization.
//!
//! Calls the Ollama REST API to generate episode summaries from transcript
//! text. The pipeline consumes it through the [`Summarizer`] seam.

use crate::database::SummaryLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2:3b";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Keep prompts inside the model's context window. Long episodes get the
/// head of the transcript; the cut lands on a char boundary.
const TRANSCRIPT_CHAR_LIMIT: usize = 48_000;

/// Opaque structured result persisted as the job's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryContent {
    pub summary: String,
    pub model: String,
    pub level: SummaryLevel,
    pub language: String,
}

/// Summarization provider seam.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        transcript_text: &str,
        level: SummaryLevel,
        language: &str,
    ) -> Result<SummaryContent, String>;
}

/// Ollama client for making API calls
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: OLLAMA_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Check if Ollama is running and the model is available
    pub async fn health_check(&self) -> Result<OllamaStatus, String> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&tags_url)
            .send()
            .await
            .map_err(|e| format!("Ollama not running: {}", e))?;

        if !response.status().is_success() {
            return Err("Ollama server returned error".to_string());
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse Ollama response: {}", e))?;

        let model_available = tags.models.iter().any(|m| {
            m.name
                .starts_with(self.model.split(':').next().unwrap_or(&self.model))
        });

        Ok(OllamaStatus {
            running: true,
            model: self.model.clone(),
            model_available,
        })
    }

    /// Generate a completion from Ollama
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.map(|s| s.to_string()),
            stream: false,
            options: Some(GenerateOptions {
                temperature: 0.3,
                num_predict: 2048,
            }),
        };

        log::info!(
            "Sending request to Ollama: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("Failed to call Ollama: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Ollama returned {}: {}", status, body));
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse Ollama response: {}", e))?;

        log::info!(
            "Ollama response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for OllamaClient {
    async fn summarize(
        &self,
        transcript_text: &str,
        level: SummaryLevel,
        language: &str,
    ) -> Result<SummaryContent, String> {
        let text = truncate_on_char_boundary(transcript_text, TRANSCRIPT_CHAR_LIMIT);

        let instruction = match level {
            SummaryLevel::Quick => {
                "Summarize this podcast episode in 4-6 sentences. Cover the main topics and \
                 the most important takeaways. No preamble."
            }
            SummaryLevel::Deep => {
                "Write a detailed summary of this podcast episode. Start with a one-paragraph \
                 overview, then list the main topics discussed with the key points made about \
                 each, and finish with notable quotes or moments. No preamble."
            }
        };

        let prompt = format!("{}\n\n---\nTRANSCRIPT:\n{}\n---", instruction, text);
        let system = format!(
            "You are a podcast summarization assistant. Respond in the language with \
             ISO code '{}'. Be faithful to the transcript; never invent content.",
            language
        );

        let summary = self.generate(&prompt, Some(&system)).await?;

        Ok(SummaryContent {
            summary: summary.trim().to_string(),
            model: self.model.clone(),
            level,
            language: language.to_string(),
        })
    }
}

fn truncate_on_char_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── API types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Serialize)]
pub struct OllamaStatus {
    pub running: bool,
    pub model: String,
    pub model_available: bool,
}
