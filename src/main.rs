use anyhow::{Context, Result};
use podcast_recap::config::Config;
use podcast_recap::database::Database;
use podcast_recap::ollama::OllamaClient;
use podcast_recap::pipeline::Pipeline;
use podcast_recap::ratelimit::RateLimiter;
use podcast_recap::server::{self, AppState};
use podcast_recap::stt::{RetryPolicy, SttAdapter, SttClient};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let db = Arc::new(
        Database::new(&config.database_path)
            .with_context(|| format!("opening database at {:?}", config.database_path))?,
    );

    let limiter = Arc::new(match &config.redis_url {
        Some(url) => RateLimiter::connect(url).await,
        None => {
            tracing::info!("REDIS_URL not set, rate limiting disabled");
            RateLimiter::disabled()
        }
    });

    let stt_client = Arc::new(SttClient::new(
        &config.stt_api_url,
        config.stt_api_key.clone(),
    ));
    let adapter = Arc::new(SttAdapter::new(stt_client, RetryPolicy::default())?);
    let summarizer = Arc::new(
        OllamaClient::new()
            .with_base_url(&config.ollama_base_url)
            .with_model(&config.ollama_model),
    );

    let pipeline = Pipeline::new(db.clone(), adapter, summarizer);

    let state = AppState {
        db,
        pipeline,
        limiter,
        config: config.clone(),
        http: reqwest::Client::new(),
    };
    let app = server::router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal received");
    }
}
