//! Feed refresh: size-guarded fetch, enclosure extraction, episode upsert.
//!
//! The pipeline only needs enough catalog to resolve an episode's audio URL;
//! everything else about feed handling stays out of scope.

use crate::database::Database;
use crate::error::AppError;
use crate::fetch::{self, FetchError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct FeedSyncResult {
    pub added: i64,
    pub updated: i64,
    pub total: i64,
}

/// Fetch and parse a feed, upserting one episode per entry with an audio
/// enclosure. The fetch goes through the payload size guard — a hostile
/// feed is rejected before parsing.
pub async fn sync_feed(
    db: &Database,
    client: &reqwest::Client,
    feed_url: &str,
    source: &str,
    max_bytes: u64,
) -> Result<FeedSyncResult, AppError> {
    log::info!("Fetching feed from: {}", feed_url);

    let body = fetch::fetch_limited(client, feed_url, max_bytes)
        .await
        .map_err(|e| match e {
            FetchError::TooLarge { .. } => AppError::PayloadTooLarge(e.to_string()),
            other => AppError::Other(format!("Failed to fetch feed: {}", other)),
        })?;

    let feed = feed_rs::parser::parse(body.as_slice())
        .map_err(|e| AppError::Other(format!("Failed to parse feed: {}", e)))?;

    log::info!("Parsed {} entries from feed", feed.entries.len());

    let mut added = 0i64;
    let mut updated = 0i64;

    for entry in feed.entries {
        // Audio URL from the media enclosure, falling back to audio links
        let audio_url = entry
            .media
            .first()
            .and_then(|m| m.content.first())
            .and_then(|c| c.url.as_ref())
            .map(|u| u.to_string())
            .or_else(|| {
                entry
                    .links
                    .iter()
                    .find(|l| {
                        l.media_type
                            .as_deref()
                            .map_or(false, |t| t.starts_with("audio/"))
                    })
                    .map(|l| l.href.clone())
            });

        let audio_url = match audio_url {
            Some(url) => url,
            None => continue, // Skip entries without audio
        };

        let title = entry.title.map(|t| t.content).unwrap_or_default();
        let description = entry.summary.map(|s| s.content);
        let published_date = entry.published.map(|d| d.to_rfc3339());

        let (_, is_new) = db.upsert_episode(
            &title,
            description.as_deref(),
            &audio_url,
            None,
            published_date.as_deref(),
            source,
        )?;

        if is_new {
            added += 1;
        } else {
            updated += 1;
        }
    }

    log::info!("Feed refresh completed: {} added, {} updated", added, updated);

    Ok(FeedSyncResult {
        added,
        updated,
        total: added + updated,
    })
}
