//! Resilient HTTP fetch helpers shared by the transcription adapter and
//! feed refresh: tracking-redirect resolution and size-guarded downloads.

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_REDIRECTS: usize = 5;
pub const DEFAULT_HOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Cap on any text/XML payload fetched while resolving feed or transcript
/// data. Hostile or malformed feeds must not buffer unbounded memory.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 30 * 1024 * 1024;

/// Extensions that mark a URL as already pointing at an audio file, so
/// redirect resolution can be skipped entirely.
const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "m4b", "wav", "aac", "ogg", "oga", "opus", "flac", "mp4", "mpga", "webm",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Request failed with status {0}")]
    Status(StatusCode),

    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

/// Client for redirect probes: automatic redirects disabled so each hop is
/// observed and bounded individually.
pub fn probe_client() -> reqwest::Result<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .build()
}

pub fn has_direct_audio_extension(url: &str) -> bool {
    let path = match Url::parse(url) {
        Ok(u) => u.path().to_ascii_lowercase(),
        Err(_) => return false,
    };
    AUDIO_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(&format!(".{}", ext)))
}

/// Resolve the tracking-redirect chain in front of a podcast audio URL.
///
/// URLs that already carry a direct-audio extension are returned unchanged
/// without any network call. Otherwise each hop is a HEAD probe with its own
/// timeout; the timeout future owns the hop timer, so it is released on
/// every exit path. Probe errors and timeouts are never fatal — resolution
/// stops and the last-known URL is used.
pub async fn resolve_audio_url(
    client: &Client,
    url: &str,
    max_redirects: usize,
    hop_timeout: Duration,
) -> String {
    if has_direct_audio_extension(url) {
        return url.to_string();
    }

    let mut current = url.to_string();

    for hop in 0..max_redirects {
        let response = match tokio::time::timeout(hop_timeout, client.head(&current).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::warn!("Redirect probe failed at hop {} for {}: {}", hop, current, e);
                return current;
            }
            Err(_) => {
                log::warn!("Redirect probe timed out at hop {} for {}", hop, current);
                return current;
            }
        };

        if !response.status().is_redirection() {
            return current;
        }

        let location = match response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
            Some(location) => location.to_string(),
            None => return current,
        };

        // Location may be relative; join against the current URL.
        current = match Url::parse(&current).and_then(|base| base.join(&location)) {
            Ok(next) => next.to_string(),
            Err(_) => return current,
        };
    }

    log::debug!(
        "Stopped redirect resolution after {} hops: {}",
        max_redirects,
        current
    );
    current
}

/// Fetch a payload with the size guard.
///
/// A declared `Content-Length` over the cap is rejected before any body byte
/// is read. When the header is absent or understated, the stream is rejected
/// as soon as the buffered size would exceed the cap — before any parsing.
pub async fn fetch_limited(client: &Client, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }

    read_limited(response, max_bytes).await
}

/// Buffer a response body under the size guard. Split out so non-GET
/// provider calls can apply the same checks to their responses.
pub async fn read_limited(response: reqwest::Response, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    if let Some(declared) = response.content_length() {
        if declared > max_bytes {
            return Err(FetchError::TooLarge {
                size: declared,
                limit: max_bytes,
            });
        }
    }

    let mut body: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let next_size = body.len() as u64 + chunk.len() as u64;
        if next_size > max_bytes {
            return Err(FetchError::TooLarge {
                size: next_size,
                limit: max_bytes,
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}
