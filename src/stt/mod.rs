//! Speech-to-text provider client and the resilience adapter around it.
//!
//! The adapter owns everything that makes a provider call survivable in the
//! wild: tracking-redirect resolution for the audio URL, bounded retry with
//! doubling backoff, and the response size guard. The provider itself sits
//! behind the [`Transcriber`] trait so tests can script it.

use crate::fetch::{self, FetchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// One speaker-attributed span of a diarized transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: u32,
    pub text: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Structured transcription result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub utterances: Vec<Utterance>,
    pub full_text: String,
    pub duration_secs: f64,
    pub speaker_count: u32,
    pub detected_language: String,
}

#[derive(Debug, Error)]
pub enum TranscribeError {
    /// Network blips and 5xx-equivalent responses. Retried with backoff.
    #[error("Transcription provider error: {0}")]
    Transient(String),

    /// 4xx-equivalent, permanent by nature. Never retried.
    #[error("Transcription request rejected: {0}")]
    Permanent(String),

    /// Response exceeded the size guard. Deterministic, not retried.
    #[error("Transcription payload too large: {0}")]
    Capacity(String),
}

impl TranscribeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<FetchError> for TranscribeError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::TooLarge { .. } => Self::Capacity(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Retry policy for provider calls: doubling backoff from `base_delay`,
/// `max_retries` retries after the first attempt (1s, 2s, 4s by default).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-indexed): `base * 2^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// External speech-to-text provider seam.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_url: &str, language: &str)
        -> Result<Transcript, TranscribeError>;

    fn provider_name(&self) -> &str;
}

/// Resilience wrapper the pipeline actually calls.
pub struct SttAdapter {
    provider: Arc<dyn Transcriber>,
    probe_client: reqwest::Client,
    retry: RetryPolicy,
    max_redirects: usize,
    hop_timeout: Duration,
}

impl SttAdapter {
    pub fn new(provider: Arc<dyn Transcriber>, retry: RetryPolicy) -> reqwest::Result<Self> {
        Ok(Self {
            provider,
            probe_client: fetch::probe_client()?,
            retry,
            max_redirects: fetch::DEFAULT_MAX_REDIRECTS,
            hop_timeout: fetch::DEFAULT_HOP_TIMEOUT,
        })
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    /// Resolve the audio URL, then call the provider with bounded retry.
    /// Permanent errors fail fast; transient ones retry until the policy is
    /// exhausted, at which point the last error is raised.
    pub async fn transcribe(
        &self,
        audio_url: &str,
        language: &str,
    ) -> Result<Transcript, TranscribeError> {
        let resolved = fetch::resolve_audio_url(
            &self.probe_client,
            audio_url,
            self.max_redirects,
            self.hop_timeout,
        )
        .await;

        let mut attempt = 0u32;
        loop {
            match self.provider.transcribe(&resolved, language).await {
                Ok(transcript) => return Ok(transcript),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    log::warn!(
                        "Transcription attempt {} failed, retrying in {:?}: {}",
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ── HTTP provider client ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_url: &'a str,
    language: &'a str,
    diarize: bool,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    utterances: Vec<ResponseUtterance>,
    language: String,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct ResponseUtterance {
    speaker: u32,
    text: String,
    start: f64,
    end: f64,
}

/// Client for the hosted transcription API.
pub struct SttClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    provider_name: String,
    max_response_bytes: u64,
}

impl SttClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            provider_name: "hosted-stt".to_string(),
            max_response_bytes: fetch::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }
}

#[async_trait]
impl Transcriber for SttClient {
    async fn transcribe(
        &self,
        audio_url: &str,
        language: &str,
    ) -> Result<Transcript, TranscribeError> {
        let url = format!("{}/v1/transcripts", self.base_url);
        let request = TranscribeRequest {
            audio_url,
            language,
            diarize: true,
        };

        log::info!(
            "Requesting transcription: url_len={}, language={}",
            audio_url.len(),
            language
        );

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TranscribeError::Transient(format!("Failed to call provider: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscribeError::Permanent(format!(
                "Provider returned {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscribeError::Transient(format!(
                "Provider returned {}: {}",
                status, body
            )));
        }

        // Guard the payload before any parsing is attempted.
        let bytes = fetch::read_limited(response, self.max_response_bytes).await?;
        let parsed: TranscribeResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TranscribeError::Transient(format!("Malformed provider response: {}", e)))?;

        let full_text = parsed
            .utterances
            .iter()
            .map(|u| u.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let speakers: HashSet<u32> = parsed.utterances.iter().map(|u| u.speaker).collect();
        let duration = if parsed.duration > 0.0 {
            parsed.duration
        } else {
            parsed.utterances.last().map(|u| u.end).unwrap_or(0.0)
        };

        Ok(Transcript {
            utterances: parsed
                .utterances
                .into_iter()
                .map(|u| Utterance {
                    speaker: u.speaker,
                    text: u.text,
                    start_secs: u.start,
                    end_secs: u.end,
                })
                .collect(),
            full_text,
            duration_secs: duration,
            speaker_count: speakers.len() as u32,
            detected_language: parsed.language,
        })
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }
}
