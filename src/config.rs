//! Environment-driven configuration with a `.env` fallback.

use crate::fetch;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: PathBuf,
    /// Shared counter store; rate limiting is disabled when unset.
    pub redis_url: Option<String>,
    pub stt_api_url: String,
    pub stt_api_key: Option<String>,
    pub ollama_base_url: String,
    pub ollama_model: String,
    /// Submissions allowed per identifier per minute.
    pub submit_rate_limit: u32,
    /// Status reads allowed per identifier per minute.
    pub status_rate_limit: u32,
    /// Summary jobs per user per day.
    pub daily_summary_quota: u32,
    pub max_feed_bytes: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let get = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| load_env_value(&cwd, key))
        };

        let database_path = get("RECAP_DB").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("podcast-recap")
                .join("recap.db")
        });

        Self {
            bind_addr: get("RECAP_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            database_path,
            redis_url: get("REDIS_URL"),
            stt_api_url: get("STT_API_URL")
                .unwrap_or_else(|| "http://localhost:9000".to_string()),
            stt_api_key: get("STT_API_KEY"),
            ollama_base_url: get("OLLAMA_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            ollama_model: get("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2:3b".to_string()),
            submit_rate_limit: parse_or(get("SUBMIT_RATE_LIMIT"), 10),
            status_rate_limit: parse_or(get("STATUS_RATE_LIMIT"), 120),
            daily_summary_quota: parse_or(get("DAILY_SUMMARY_QUOTA"), 50),
            max_feed_bytes: parse_or(get("MAX_FEED_BYTES"), fetch::DEFAULT_MAX_PAYLOAD_BYTES),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Load a value from the .env file by key name
pub fn load_env_value(project_dir: &Path, key: &str) -> Option<String> {
    let env_path = project_dir.join(".env");
    let prefix = format!("{}=", key);
    if let Ok(content) = std::fs::read_to_string(&env_path) {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with(&prefix) {
                let value = trimmed[prefix.len()..]
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
