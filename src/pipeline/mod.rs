//! Job-status state machine for episode processing.
//!
//! The authoritative record of transcript/summary progress lives in the
//! database; this module drives the transitions: claim (dedup), transcribe
//! through the resilience adapter, self-healing language correction,
//! summarize, persist. Status reads never block on in-flight work.

use crate::database::{
    ClaimOutcome, Database, Episode, SummaryLevel, SummaryStatus, TranscriptStatus,
};
use crate::error::AppError;
use crate::ollama::Summarizer;
use crate::stt::SttAdapter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How often a job waiting on another job's transcription re-checks the row.
const TRANSCRIPT_WAIT_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on that wait before the dependent job gives up.
const TRANSCRIPT_WAIT_BUDGET: Duration = Duration::from_secs(15 * 60);

// ── Wire types ─────────────────────────────────────────────────────────────

/// Snapshot returned by both the submit and status endpoints: the latest
/// persisted state, assembled read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub transcript: TranscriptView,
    pub summaries: SummariesView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptView {
    pub status: TranscriptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummariesView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick: Option<SummaryView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep: Option<SummaryView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryView {
    pub status: SummaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn level(&self, level: SummaryLevel) -> Option<&SummaryView> {
        match level {
            SummaryLevel::Quick => self.summaries.quick.as_ref(),
            SummaryLevel::Deep => self.summaries.deep.as_ref(),
        }
    }

    pub fn display_state(&self, level: SummaryLevel) -> DisplayState {
        derive_display_state(self.transcript.status, self.level(level).map(|s| s.status))
    }

    /// First error worth showing for this level, if any.
    pub fn error(&self, level: SummaryLevel) -> Option<&str> {
        self.level(level)
            .and_then(|s| s.error.as_deref())
            .or(self.transcript.error.as_deref())
    }
}

/// User-visible state for one `(episode, level)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    NotReady,
    Transcribing,
    Summarizing,
    Ready,
    Failed,
}

/// The one projection from the dual-table status to a display state.
///
/// Precedence is defined here and nowhere else: failure wins, then the
/// transcript's progress, then the summary's. A `queued` transcript is
/// deliberately merged with `transcribing` — the record is created directly
/// in `transcribing`, so `queued` can only be observed transiently and is
/// not a distinct user-visible state.
pub fn derive_display_state(
    transcript: TranscriptStatus,
    summary: Option<SummaryStatus>,
) -> DisplayState {
    match (transcript, summary) {
        (TranscriptStatus::Failed, _) => DisplayState::Failed,
        (_, Some(SummaryStatus::Failed)) => DisplayState::Failed,
        (TranscriptStatus::NotReady, _) => DisplayState::NotReady,
        (TranscriptStatus::Queued | TranscriptStatus::Transcribing, _) => DisplayState::Transcribing,
        (TranscriptStatus::Ready, None) => DisplayState::NotReady,
        (TranscriptStatus::Ready, Some(SummaryStatus::Queued | SummaryStatus::Summarizing)) => {
            DisplayState::Summarizing
        }
        (TranscriptStatus::Ready, Some(SummaryStatus::Ready)) => DisplayState::Ready,
    }
}

// ── Pipeline ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Pipeline {
    db: Arc<Database>,
    stt: Arc<SttAdapter>,
    summarizer: Arc<dyn Summarizer>,
}

impl Pipeline {
    pub fn new(db: Arc<Database>, stt: Arc<SttAdapter>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            db,
            stt,
            summarizer,
        }
    }

    /// Start (or no-op on) a summary job for `(episode, level)`.
    ///
    /// Returns the current snapshot immediately; processing continues in a
    /// spawned task. If a non-terminal job already exists for the pair this
    /// is idempotent and starts no new work.
    pub fn submit(&self, episode_id: i64, level: SummaryLevel) -> Result<StatusSnapshot, AppError> {
        let episode = self
            .db
            .get_episode_by_id(episode_id)?
            .ok_or_else(|| AppError::NotFound(format!("episode {}", episode_id)))?;

        match self.db.claim_job(episode_id, level, &episode.language)? {
            ClaimOutcome::AlreadyActive | ClaimOutcome::AlreadyReady => {
                log::info!(
                    "Summary job for episode {} level {} already exists, returning status",
                    episode_id,
                    level
                );
            }
            ClaimOutcome::Claimed { transcript_active } => {
                if let Err(msg) = validate_audio_url(&episode.audio_url) {
                    // Client error: surfaced immediately as failed, no retries.
                    log::warn!("Rejecting episode {}: {}", episode_id, msg);
                    self.db.fail_transcript(episode_id, &msg)?;
                    self.db.fail_summary(episode_id, level, &msg)?;
                } else {
                    log::info!(
                        "Starting summary job: episode={} level={} language={}",
                        episode_id,
                        level,
                        episode.language
                    );
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        pipeline.process_job(episode, level, transcript_active).await;
                    });
                }
            }
        }

        self.status_snapshot(episode_id)
    }

    /// Read-only status for an episode. Never blocks on in-flight work.
    pub fn get_status(&self, episode_id: i64) -> Result<StatusSnapshot, AppError> {
        if self.db.get_episode_by_id(episode_id)?.is_none() {
            return Err(AppError::NotFound(format!("episode {}", episode_id)));
        }
        self.status_snapshot(episode_id)
    }

    fn status_snapshot(&self, episode_id: i64) -> Result<StatusSnapshot, AppError> {
        let transcript = self.db.get_transcript_record(episode_id)?;
        let transcript = TranscriptView {
            status: transcript
                .as_ref()
                .map(|t| t.status)
                .unwrap_or(TranscriptStatus::NotReady),
            error: transcript.and_then(|t| t.error_message),
        };

        let mut summaries = SummariesView {
            quick: None,
            deep: None,
        };
        for record in self.db.get_summaries(episode_id)? {
            let content = match (&record.status, &record.content) {
                (SummaryStatus::Ready, Some(json)) => serde_json::from_str(json).ok(),
                _ => None,
            };
            let view = SummaryView {
                status: record.status,
                content,
                error: record.error_message,
            };
            match record.level {
                SummaryLevel::Quick => summaries.quick = Some(view),
                SummaryLevel::Deep => summaries.deep = Some(view),
            }
        }

        Ok(StatusSnapshot {
            transcript,
            summaries,
        })
    }

    async fn process_job(self, episode: Episode, level: SummaryLevel, transcript_active: bool) {
        let episode_id = episode.id;

        if transcript_active {
            // Another in-flight job owns the transcription; wait for it to
            // settle rather than paying the provider twice.
            match self.wait_for_transcript(episode_id).await {
                Ok((full_text, language)) => {
                    self.run_summary(episode_id, level, &full_text, &language).await;
                }
                Err(msg) => {
                    log::error!(
                        "Episode {} level {} could not use shared transcript: {}",
                        episode_id,
                        level,
                        msg
                    );
                    let _ = self.db.fail_summary(episode_id, level, &msg);
                }
            }
            return;
        }

        // Reuse a ready transcript when its language is still the configured one.
        if let Ok(Some(existing)) = self.db.get_transcript_record(episode_id) {
            if existing.status == TranscriptStatus::Ready
                && existing.language.as_deref() == Some(episode.language.as_str())
            {
                if let Some(full_text) = existing.full_text {
                    let language = existing.language.unwrap_or_else(|| episode.language.clone());
                    self.run_summary(episode_id, level, &full_text, &language).await;
                    return;
                }
            }
        }

        self.transcribe_and_summarize(episode, level).await;
    }

    async fn transcribe_and_summarize(&self, episode: Episode, level: SummaryLevel) {
        let episode_id = episode.id;
        let mut language = episode.language.clone();
        let mut corrected = false;

        if let Err(e) = self.db.begin_transcription(episode_id) {
            log::error!("Failed to start transcription for episode {}: {}", episode_id, e);
            return;
        }

        loop {
            let transcript = match self.stt.transcribe(&episode.audio_url, &language).await {
                Ok(transcript) => transcript,
                Err(e) => {
                    let msg = if corrected {
                        format!("Language correction to '{}' failed: {}", language, e)
                    } else {
                        e.to_string()
                    };
                    log::error!("Transcription failed for episode {}: {}", episode_id, msg);
                    let _ = self.db.fail_transcript(episode_id, &msg);
                    let _ = self.db.fail_summary(episode_id, level, &msg);
                    return;
                }
            };

            // Self-healing language correction: the artifacts produced under
            // the wrong language assumption are stale. At most one pass per
            // job; a second mismatch is recorded as-is.
            if transcript.detected_language != language && !corrected {
                corrected = true;
                log::info!(
                    "Detected language '{}' differs from configured '{}' for episode {}, reprocessing",
                    transcript.detected_language,
                    language,
                    episode_id
                );
                language = transcript.detected_language.clone();
                if let Err(e) = self.apply_language_correction(episode_id, level, &language) {
                    let msg = format!("Language correction to '{}' failed: {}", language, e);
                    log::error!("{}", msg);
                    let _ = self.db.fail_transcript(episode_id, &msg);
                    let _ = self.db.fail_summary(episode_id, level, &msg);
                    return;
                }
                continue;
            }

            let segments_json = match serde_json::to_string(&transcript.utterances) {
                Ok(json) => json,
                Err(e) => {
                    let msg = format!("Failed to encode transcript segments: {}", e);
                    let _ = self.db.fail_transcript(episode_id, &msg);
                    let _ = self.db.fail_summary(episode_id, level, &msg);
                    return;
                }
            };

            if let Err(e) = self.db.complete_transcript(
                episode_id,
                &transcript.full_text,
                &segments_json,
                &transcript.detected_language,
                self.stt.provider_name(),
                transcript.duration_secs,
                transcript.speaker_count as i64,
            ) {
                log::error!("Failed to persist transcript for episode {}: {}", episode_id, e);
                return;
            }

            log::info!(
                "Transcription ready for episode {}: {} utterances, {} speakers, language={}",
                episode_id,
                transcript.utterances.len(),
                transcript.speaker_count,
                transcript.detected_language
            );

            self.run_summary(
                episode_id,
                level,
                &transcript.full_text,
                &transcript.detected_language,
            )
            .await;
            return;
        }
    }

    /// Supersede the stale transcript and re-point the job at the detected
    /// language. The transcript row is recreated directly in `transcribing`.
    fn apply_language_correction(
        &self,
        episode_id: i64,
        level: SummaryLevel,
        language: &str,
    ) -> anyhow::Result<()> {
        self.db.delete_transcript(episode_id)?;
        self.db.begin_transcription(episode_id)?;
        self.db.set_episode_language(episode_id, language)?;
        self.db.mark_language_corrected(episode_id, level, language)?;
        Ok(())
    }

    async fn run_summary(&self, episode_id: i64, level: SummaryLevel, full_text: &str, language: &str) {
        if let Err(e) = self.db.mark_summarizing(episode_id, level) {
            log::error!("Failed to mark summarizing for episode {}: {}", episode_id, e);
            return;
        }

        match self.summarizer.summarize(full_text, level, language).await {
            Ok(content) => {
                let model = content.model.clone();
                match serde_json::to_string(&content) {
                    Ok(json) => {
                        if let Err(e) = self.db.complete_summary(episode_id, level, &json, &model) {
                            log::error!(
                                "Failed to persist summary for episode {}: {}",
                                episode_id,
                                e
                            );
                        } else {
                            log::info!("Summary ready: episode={} level={}", episode_id, level);
                        }
                    }
                    Err(e) => {
                        let msg = format!("Failed to encode summary content: {}", e);
                        let _ = self.db.fail_summary(episode_id, level, &msg);
                    }
                }
            }
            Err(e) => {
                let msg = format!("Summary generation failed: {}", e);
                log::error!("Episode {} level {}: {}", episode_id, level, msg);
                let _ = self.db.fail_summary(episode_id, level, &msg);
            }
        }
    }

    /// Wait for another job's transcription to settle. Returns the text and
    /// language on `ready`; an error string if it failed or the wait budget
    /// ran out.
    async fn wait_for_transcript(&self, episode_id: i64) -> Result<(String, String), String> {
        let started = tokio::time::Instant::now();
        loop {
            let record = self
                .db
                .get_transcript_record(episode_id)
                .map_err(|e| e.to_string())?;

            match record {
                Some(r) if r.status == TranscriptStatus::Ready => {
                    let language = r.language.unwrap_or_else(|| "en".to_string());
                    return match r.full_text {
                        Some(text) => Ok((text, language)),
                        None => Err("Transcript is ready but has no text".to_string()),
                    };
                }
                Some(r) if r.status == TranscriptStatus::Failed => {
                    return Err(r
                        .error_message
                        .unwrap_or_else(|| "Transcription failed".to_string()));
                }
                // Still in flight (or transiently recreated by a language
                // correction) — keep waiting.
                _ => {}
            }

            if started.elapsed() > TRANSCRIPT_WAIT_BUDGET {
                return Err("Timed out waiting for shared transcript".to_string());
            }
            tokio::time::sleep(TRANSCRIPT_WAIT_INTERVAL).await;
        }
    }
}

fn validate_audio_url(url: &str) -> Result<(), String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err("Invalid audio URL: empty".to_string());
    }
    match reqwest::Url::parse(trimmed) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        Ok(parsed) => Err(format!("Invalid audio URL scheme: {}", parsed.scheme())),
        Err(e) => Err(format!("Invalid audio URL: {}", e)),
    }
}
