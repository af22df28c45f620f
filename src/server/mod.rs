//! HTTP surface exposed to the client scheduler.
//!
//! Thin handlers over the pipeline: submission returns immediately with the
//! current snapshot, status is a pure read. Rate/quota checks guard both
//! endpoints and fail open when the counter store is degraded.

use crate::config::Config;
use crate::database::{Database, SummaryLevel};
use crate::error::AppError;
use crate::feed::{self, FeedSyncResult};
use crate::pipeline::{Pipeline, StatusSnapshot};
use crate::ratelimit::RateLimiter;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const RATE_WINDOW_SECS: u64 = 60;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub pipeline: Pipeline,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/episodes/:id/summaries",
            post(submit_summary).get(get_summaries),
        )
        .route("/feeds/refresh", post(refresh_feed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Requester identity for rate limiting: forwarded address when behind a
/// proxy, an explicit user header otherwise, else a shared bucket.
fn client_identifier(headers: &HeaderMap) -> String {
    if let Some(user) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        return user.to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    level: SummaryLevel,
}

/// POST /episodes/:id/summaries — start (or no-op on) a job.
async fn submit_summary(
    State(state): State<AppState>,
    Path(episode_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let who = client_identifier(&headers);

    if !state
        .limiter
        .check_rate_limit(
            &format!("summaries:submit:{}", who),
            state.config.submit_rate_limit,
            RATE_WINDOW_SECS,
        )
        .await
    {
        return Err(AppError::RateLimited);
    }
    if !state
        .limiter
        .check_quota(&who, "summaries", state.config.daily_summary_quota)
        .await
    {
        return Err(AppError::RateLimited);
    }

    let snapshot = state.pipeline.submit(episode_id, body.level)?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// GET /episodes/:id/summaries — latest persisted snapshot.
async fn get_summaries(
    State(state): State<AppState>,
    Path(episode_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<StatusSnapshot>, AppError> {
    let who = client_identifier(&headers);

    if !state
        .limiter
        .check_rate_limit(
            &format!("summaries:status:{}", who),
            state.config.status_rate_limit,
            RATE_WINDOW_SECS,
        )
        .await
    {
        return Err(AppError::RateLimited);
    }

    Ok(Json(state.pipeline.get_status(episode_id)?))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    url: String,
    #[serde(default)]
    source: Option<String>,
}

/// POST /feeds/refresh — size-guarded feed sync.
async fn refresh_feed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<FeedSyncResult>, AppError> {
    let who = client_identifier(&headers);

    if !state
        .limiter
        .check_rate_limit(
            &format!("feeds:refresh:{}", who),
            state.config.submit_rate_limit,
            RATE_WINDOW_SECS,
        )
        .await
    {
        return Err(AppError::RateLimited);
    }

    let source = body.source.as_deref().unwrap_or("rss");
    let result = feed::sync_feed(
        &state.db,
        &state.http,
        &body.url,
        source,
        state.config.max_feed_bytes,
    )
    .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ollama::{Summarizer, SummaryContent};
    use crate::pipeline::DisplayState;
    use crate::stt::{RetryPolicy, SttAdapter, TranscribeError, Transcriber, Transcript, Utterance};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct StubProvider;

    #[async_trait]
    impl Transcriber for StubProvider {
        async fn transcribe(
            &self,
            _audio_url: &str,
            language: &str,
        ) -> Result<Transcript, TranscribeError> {
            Ok(Transcript {
                utterances: vec![Utterance {
                    speaker: 0,
                    text: "hi".to_string(),
                    start_secs: 0.0,
                    end_secs: 1.0,
                }],
                full_text: "hi".to_string(),
                duration_secs: 1.0,
                speaker_count: 1,
                detected_language: language.to_string(),
            })
        }

        fn provider_name(&self) -> &str {
            "stub"
        }
    }

    struct StubSummarizer;

    #[async_trait]
    impl Summarizer for StubSummarizer {
        async fn summarize(
            &self,
            _transcript_text: &str,
            level: SummaryLevel,
            language: &str,
        ) -> Result<SummaryContent, String> {
            Ok(SummaryContent {
                summary: "stub summary".to_string(),
                model: "stub".to_string(),
                level,
                language: language.to_string(),
            })
        }
    }

    fn test_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
        let adapter = SttAdapter::new(
            Arc::new(StubProvider),
            RetryPolicy {
                max_retries: 0,
                base_delay: std::time::Duration::from_millis(1),
            },
        )
        .unwrap();
        let pipeline = Pipeline::new(db.clone(), Arc::new(adapter), Arc::new(StubSummarizer));
        let state = AppState {
            db,
            pipeline,
            limiter: Arc::new(RateLimiter::disabled()),
            config: Arc::new(crate::config::Config::from_env()),
            http: reqwest::Client::new(),
        };
        (state, temp_dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_for_unknown_episode_is_404() {
        let (state, _tmp) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/episodes/42/summaries")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fresh_episode_reports_not_ready() {
        let (state, _tmp) = test_state();
        let id = state
            .db
            .upsert_episode("Ep", None, "https://cdn.example.com/e.mp3", None, None, "rss")
            .unwrap()
            .0;
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/episodes/{}/summaries", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["transcript"]["status"], "not_ready");
        assert!(json["summaries"].get("quick").is_none());
    }

    #[tokio::test]
    async fn submit_accepts_and_reports_progress() {
        let (state, _tmp) = test_state();
        let id = state
            .db
            .upsert_episode("Ep", None, "https://cdn.example.com/e.mp3", None, None, "rss")
            .unwrap()
            .0;
        let pipeline = state.pipeline.clone();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/episodes/{}/summaries", id))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"level":"quick"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        // Written directly in transcribing: no separate queued write.
        assert_eq!(json["transcript"]["status"], "transcribing");
        assert_eq!(json["summaries"]["quick"]["status"], "queued");

        // Stub providers complete almost immediately.
        for _ in 0..500 {
            let snapshot = pipeline.get_status(id).unwrap();
            if snapshot.display_state(SummaryLevel::Quick) == DisplayState::Ready {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/episodes/{}/summaries", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["transcript"]["status"], "ready");
        assert_eq!(json["summaries"]["quick"]["status"], "ready");
        assert_eq!(json["summaries"]["quick"]["content"]["summary"], "stub summary");
    }

    #[tokio::test]
    async fn invalid_level_is_rejected() {
        let (state, _tmp) = test_state();
        let id = state
            .db
            .upsert_episode("Ep", None, "https://cdn.example.com/e.mp3", None, None, "rss")
            .unwrap()
            .0;
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/episodes/{}/summaries", id))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"level":"medium"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn identifier_prefers_user_then_forwarded_ip() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_identifier(&headers), "local");

        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_identifier(&headers), "10.1.2.3");

        headers.insert("x-user-id", "user-9".parse().unwrap());
        assert_eq!(client_identifier(&headers), "user-9");
    }
}
