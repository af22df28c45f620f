//! Client-side job queue and polling scheduler.
//!
//! The queue mirrors the server's state machine through polling only — no
//! job state is written from here. One item submits at a time (FIFO), each
//! in-flight job holds a cancellable token in a per-id map, polling backs
//! off adaptively with jitter, and `pause()`/`resume()` let the host stop
//! polls while its surface is hidden and pick up again immediately on
//! return. Failures are never dropped silently: every outcome lands in the
//! item's state and the running stats.

use crate::database::SummaryLevel;
use crate::pipeline::{DisplayState, StatusSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Transport seam to the summaries API. Production uses HTTP; tests script it.
#[async_trait]
pub trait SummariesApi: Send + Sync {
    async fn submit(
        &self,
        episode_id: i64,
        level: SummaryLevel,
    ) -> Result<StatusSnapshot, String>;

    async fn status(&self, episode_id: i64) -> Result<StatusSnapshot, String>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// First poll after submission comes quickly.
    pub initial_poll: Duration,
    /// Base interval while the server reports active work.
    pub poll_base: Duration,
    /// Hard cap on the computed interval.
    pub poll_cap: Duration,
    /// The backoff factor grows one step every this many polls.
    pub backoff_every: u32,
    pub backoff_factor: f64,
    /// Random spread applied to every computed interval (0.2 = ±20%).
    pub jitter: f64,
    /// Total poll budget before an item is force-failed.
    pub max_poll_duration: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_poll: Duration::from_secs(2),
            poll_base: Duration::from_secs(10),
            poll_cap: Duration::from_secs(30),
            backoff_every: 3,
            backoff_factor: 1.5,
            jitter: 0.2,
            max_poll_duration: Duration::from_secs(10 * 60),
            max_retries: 1,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Base interval for poll number `polls` (0-indexed), jitter excluded.
/// Non-decreasing up to the cap.
pub fn base_poll_interval(config: &SchedulerConfig, polls: u32) -> Duration {
    if polls == 0 {
        return config.initial_poll;
    }
    let steps = (polls - 1) / config.backoff_every.max(1);
    let factor = config.backoff_factor.powi(steps as i32);
    let secs = config.poll_base.as_secs_f64() * factor;
    Duration::from_secs_f64(secs.min(config.poll_cap.as_secs_f64()))
}

/// Spread an interval by ±`jitter` so many clients never sync their polls.
pub fn apply_jitter(interval: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let spread = rng.gen_range(-jitter..=jitter);
    Duration::from_secs_f64((interval.as_secs_f64() * (1.0 + spread)).max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Transcribing,
    Summarizing,
    Ready,
    Failed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub episode_id: i64,
    pub level: SummaryLevel,
    pub state: ItemState,
    pub retry_count: u32,
    pub added_at: DateTime<Utc>,
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

enum AttemptOutcome {
    Ready,
    Failed(String),
    TimedOut,
}

struct Inner {
    items: HashMap<i64, QueueItem>,
    /// The one item allowed to have dialed the submission endpoint.
    processing_id: Option<i64>,
    stats: SchedulerStats,
    /// Live timer handle per in-flight job, for cancellation.
    timers: HashMap<i64, CancellationToken>,
}

struct Shared {
    api: Arc<dyn SummariesApi>,
    config: SchedulerConfig,
    inner: Mutex<Inner>,
    paused: watch::Sender<bool>,
    seq: AtomicU64,
}

/// Cheap-clone handle to the scheduler; spawned jobs hold their own clone.
#[derive(Clone)]
pub struct SummaryQueue {
    shared: Arc<Shared>,
}

impl SummaryQueue {
    pub fn new(api: Arc<dyn SummariesApi>, config: SchedulerConfig) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                api,
                config,
                inner: Mutex::new(Inner {
                    items: HashMap::new(),
                    processing_id: None,
                    stats: SchedulerStats::default(),
                    timers: HashMap::new(),
                }),
                paused,
                seq: AtomicU64::new(0),
            }),
        }
    }

    // =====================================================================
    // Queue operations
    // =====================================================================

    /// Add an episode to the queue. No-op (returns false) while a non-failed
    /// item for the id exists; a failed item is superseded by a fresh one.
    pub fn enqueue(&self, episode_id: i64, level: SummaryLevel) -> bool {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(existing) = inner.items.get(&episode_id) {
                if existing.state != ItemState::Failed {
                    log::debug!(
                        "Episode {} already queued in state {:?}, ignoring",
                        episode_id,
                        existing.state
                    );
                    return false;
                }
            }
            let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
            inner.items.insert(
                episode_id,
                QueueItem {
                    episode_id,
                    level,
                    state: ItemState::Queued,
                    retry_count: 0,
                    added_at: Utc::now(),
                    error: None,
                    seq,
                },
            );
            inner.stats.total += 1;
        }
        self.pump();
        true
    }

    /// Attach to a job already running server-side (e.g. after a reload):
    /// joins the poll loop without re-issuing a submission and without
    /// claiming the single submission slot.
    pub fn attach(&self, episode_id: i64, level: SummaryLevel) -> bool {
        let token = {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(existing) = inner.items.get(&episode_id) {
                if existing.state != ItemState::Failed {
                    return false;
                }
            }
            let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
            inner.items.insert(
                episode_id,
                QueueItem {
                    episode_id,
                    level,
                    state: ItemState::Transcribing,
                    retry_count: 0,
                    added_at: Utc::now(),
                    error: None,
                    seq,
                },
            );
            inner.stats.total += 1;
            let token = CancellationToken::new();
            inner.timers.insert(episode_id, token.clone());
            token
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Attached job for episode {} cancelled", episode_id);
                }
                _ = queue.run_job(episode_id, level, false) => {}
            }
            queue.finish_job(episode_id);
        });
        true
    }

    /// Remove an item, abandoning its pending timers and poll loop. Work the
    /// server already started is unaffected; any late result simply has no
    /// item to land on.
    pub fn remove(&self, episode_id: i64) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(token) = inner.timers.remove(&episode_id) {
            token.cancel();
        }
        inner.items.remove(&episode_id);
    }

    /// Drop terminal items and reset the stats counters. Active work is
    /// untouched.
    pub fn clear(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.items.retain(|_, item| !item.state.is_terminal());
        inner.stats = SchedulerStats::default();
    }

    // =====================================================================
    // Visibility
    // =====================================================================

    /// Stop firing polls (the host surface went hidden). In-flight HTTP
    /// calls complete; poll state is retained.
    pub fn pause(&self) {
        let _ = self.shared.paused.send(true);
        log::info!("Scheduler paused");
    }

    /// Resume polling. Jobs that were waiting poll immediately — no
    /// artificial delay.
    pub fn resume(&self) {
        let _ = self.shared.paused.send(false);
        log::info!("Scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    // =====================================================================
    // Introspection
    // =====================================================================

    pub fn stats(&self) -> SchedulerStats {
        self.shared.inner.lock().unwrap().stats
    }

    pub fn get(&self, episode_id: i64) -> Option<QueueItem> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .items
            .get(&episode_id)
            .cloned()
    }

    /// Items in insertion order, for UI listings.
    pub fn items(&self) -> Vec<QueueItem> {
        let inner = self.shared.inner.lock().unwrap();
        let mut items: Vec<QueueItem> = inner.items.values().cloned().collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    // =====================================================================
    // Processing
    // =====================================================================

    /// Start the earliest queued item if the submission slot is free.
    fn pump(&self) {
        let job = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.processing_id.is_some() {
                None
            } else {
                let next = inner
                    .items
                    .values()
                    .filter(|i| i.state == ItemState::Queued)
                    .min_by_key(|i| i.seq)
                    .map(|i| (i.episode_id, i.level));
                if let Some((episode_id, level)) = next {
                    inner.processing_id = Some(episode_id);
                    let token = CancellationToken::new();
                    inner.timers.insert(episode_id, token.clone());
                    Some((episode_id, level, token))
                } else {
                    None
                }
            }
        };

        if let Some((episode_id, level, token)) = job {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::debug!("Job for episode {} cancelled", episode_id);
                    }
                    _ = queue.run_job(episode_id, level, true) => {}
                }
                queue.finish_job(episode_id);
            });
        }
    }

    fn finish_job(&self, episode_id: i64) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.timers.remove(&episode_id);
            if inner.processing_id == Some(episode_id) {
                inner.processing_id = None;
            }
        }
        self.pump();
    }

    /// Drive one item to a terminal state, applying the retry policy.
    async fn run_job(&self, episode_id: i64, level: SummaryLevel, mut submit: bool) {
        loop {
            self.set_state(episode_id, ItemState::Transcribing);

            match self.attempt(episode_id, level, submit).await {
                AttemptOutcome::Ready => {
                    self.complete(episode_id);
                    return;
                }
                AttemptOutcome::TimedOut => {
                    // The client's own budget ran out; the server may well
                    // still be working, but this item is done waiting.
                    log::warn!("Episode {} exceeded the poll budget", episode_id);
                    self.fail(episode_id, "Processing timed out".to_string());
                    return;
                }
                AttemptOutcome::Failed(error) => {
                    let retry = {
                        let mut inner = self.shared.inner.lock().unwrap();
                        match inner.items.get_mut(&episode_id) {
                            Some(item) if item.retry_count < self.shared.config.max_retries => {
                                item.retry_count += 1;
                                true
                            }
                            Some(_) => false,
                            // Item was removed mid-flight; nothing to apply.
                            None => return,
                        }
                    };

                    if retry {
                        log::warn!(
                            "Episode {} failed ({}), retrying after {:?}",
                            episode_id,
                            error,
                            self.shared.config.retry_delay
                        );
                        tokio::time::sleep(self.shared.config.retry_delay).await;
                        submit = true;
                        continue;
                    }

                    log::error!("Episode {} permanently failed: {}", episode_id, error);
                    self.fail(episode_id, error);
                    return;
                }
            }
        }
    }

    /// One submission (optional) plus a poll loop until terminal or budget.
    async fn attempt(&self, episode_id: i64, level: SummaryLevel, submit: bool) -> AttemptOutcome {
        let started = tokio::time::Instant::now();

        if submit {
            match self.shared.api.submit(episode_id, level).await {
                Ok(snapshot) => {
                    if let Some(outcome) = self.apply_snapshot(episode_id, level, &snapshot) {
                        return outcome;
                    }
                }
                Err(e) => return AttemptOutcome::Failed(format!("Submission failed: {}", e)),
            }
        }

        let mut polls: u32 = 0;
        loop {
            let interval = apply_jitter(
                base_poll_interval(&self.shared.config, polls),
                self.shared.config.jitter,
                &mut rand::thread_rng(),
            );
            self.sleep_respecting_pause(interval).await;

            if started.elapsed() > self.shared.config.max_poll_duration {
                return AttemptOutcome::TimedOut;
            }

            polls += 1;
            match self.shared.api.status(episode_id).await {
                Ok(snapshot) => {
                    if let Some(outcome) = self.apply_snapshot(episode_id, level, &snapshot) {
                        return outcome;
                    }
                }
                Err(e) => {
                    // A single failed poll is not a job failure; the next
                    // tick will try again inside the same budget.
                    log::warn!("Status poll failed for episode {}: {}", episode_id, e);
                }
            }
        }
    }

    /// Map a server snapshot onto the item. Returns a terminal outcome when
    /// the job is done.
    fn apply_snapshot(
        &self,
        episode_id: i64,
        level: SummaryLevel,
        snapshot: &StatusSnapshot,
    ) -> Option<AttemptOutcome> {
        match snapshot.display_state(level) {
            DisplayState::Ready => Some(AttemptOutcome::Ready),
            DisplayState::Failed => Some(AttemptOutcome::Failed(
                snapshot
                    .error(level)
                    .unwrap_or("Processing failed")
                    .to_string(),
            )),
            DisplayState::Transcribing => {
                self.set_state(episode_id, ItemState::Transcribing);
                None
            }
            DisplayState::Summarizing => {
                self.set_state(episode_id, ItemState::Summarizing);
                None
            }
            // The server has no record yet; keep the current state and poll on.
            DisplayState::NotReady => None,
        }
    }

    /// Sleep for `interval`, honoring pause: a paused scheduler holds the
    /// poll until resumed and then fires immediately, whether the pause
    /// began before or during the interval.
    async fn sleep_respecting_pause(&self, interval: Duration) {
        let mut rx = self.shared.paused.subscribe();

        if *rx.borrow_and_update() {
            wait_until_resumed(&mut rx).await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_until_paused(&mut rx) => {
                wait_until_resumed(&mut rx).await;
            }
        }
    }

    // =====================================================================
    // Item bookkeeping
    // =====================================================================

    fn set_state(&self, episode_id: i64, state: ItemState) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&episode_id) {
            item.state = state;
        }
    }

    fn complete(&self, episode_id: i64) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&episode_id) {
            item.state = ItemState::Ready;
            item.error = None;
            inner.stats.completed += 1;
            log::info!("Episode {} summary completed", episode_id);
        }
    }

    fn fail(&self, episode_id: i64, error: String) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&episode_id) {
            item.state = ItemState::Failed;
            item.error = Some(error);
            inner.stats.failed += 1;
        }
    }
}

async fn wait_until_paused(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone; never resolves so the sleep branch wins.
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_until_resumed(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ── HTTP transport ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SubmitBody {
    level: SummaryLevel,
}

/// `SummariesApi` over the server's HTTP contract.
pub struct HttpSummariesApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSummariesApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SummariesApi for HttpSummariesApi {
    async fn submit(
        &self,
        episode_id: i64,
        level: SummaryLevel,
    ) -> Result<StatusSnapshot, String> {
        let url = format!("{}/episodes/{}/summaries", self.base_url, episode_id);
        let response = self
            .client
            .post(&url)
            .json(&SubmitBody { level })
            .send()
            .await
            .map_err(|e| format!("Failed to reach server: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("Server returned {}", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("Malformed status response: {}", e))
    }

    async fn status(&self, episode_id: i64) -> Result<StatusSnapshot, String> {
        let url = format!("{}/episodes/{}/summaries", self.base_url, episode_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Failed to reach server: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("Server returned {}", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("Malformed status response: {}", e))
    }
}

#[cfg(test)]
mod tests;
