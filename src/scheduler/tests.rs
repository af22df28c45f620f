use super::*;
use crate::database::{SummaryStatus, TranscriptStatus};
use crate::pipeline::{SummariesView, SummaryView, TranscriptView};
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;

fn snap(
    transcript: TranscriptStatus,
    quick: Option<SummaryStatus>,
    error: Option<&str>,
) -> StatusSnapshot {
    StatusSnapshot {
        transcript: TranscriptView {
            status: transcript,
            error: None,
        },
        summaries: SummariesView {
            quick: quick.map(|status| SummaryView {
                status,
                content: matches!(status, SummaryStatus::Ready)
                    .then(|| serde_json::json!({ "summary": "done" })),
                error: error.map(|e| e.to_string()),
            }),
            deep: None,
        },
    }
}

fn transcribing_snap() -> StatusSnapshot {
    snap(TranscriptStatus::Transcribing, Some(SummaryStatus::Queued), None)
}

fn summarizing_snap() -> StatusSnapshot {
    snap(TranscriptStatus::Ready, Some(SummaryStatus::Summarizing), None)
}

fn ready_snap() -> StatusSnapshot {
    snap(TranscriptStatus::Ready, Some(SummaryStatus::Ready), None)
}

fn failed_snap(error: &str) -> StatusSnapshot {
    snap(TranscriptStatus::Ready, Some(SummaryStatus::Failed), Some(error))
}

/// Scripted transport: per-episode queues of results, last result repeats.
/// Unscripted calls report active work forever.
struct MockApi {
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
    submit_order: Mutex<Vec<i64>>,
    submits: Mutex<HashMap<i64, VecDeque<Result<StatusSnapshot, String>>>>,
    statuses: Mutex<HashMap<i64, VecDeque<Result<StatusSnapshot, String>>>>,
}

impl MockApi {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submit_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            submit_order: Mutex::new(Vec::new()),
            submits: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    fn script_submit(&self, episode_id: i64, results: Vec<Result<StatusSnapshot, String>>) {
        self.submits
            .lock()
            .unwrap()
            .insert(episode_id, results.into());
    }

    fn script_status(&self, episode_id: i64, results: Vec<Result<StatusSnapshot, String>>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(episode_id, results.into());
    }

    fn take(
        map: &Mutex<HashMap<i64, VecDeque<Result<StatusSnapshot, String>>>>,
        episode_id: i64,
    ) -> Option<Result<StatusSnapshot, String>> {
        let mut map = map.lock().unwrap();
        let queue = map.get_mut(&episode_id)?;
        let result = queue.pop_front()?;
        if queue.is_empty() {
            queue.push_back(result.clone());
        }
        Some(result)
    }

    fn submit_count(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    fn status_count(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SummariesApi for MockApi {
    async fn submit(
        &self,
        episode_id: i64,
        _level: SummaryLevel,
    ) -> Result<StatusSnapshot, String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submit_order.lock().unwrap().push(episode_id);
        Self::take(&self.submits, episode_id).unwrap_or_else(|| Ok(transcribing_snap()))
    }

    async fn status(&self, episode_id: i64) -> Result<StatusSnapshot, String> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Self::take(&self.statuses, episode_id).unwrap_or_else(|| Ok(transcribing_snap()))
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        initial_poll: Duration::from_millis(10),
        poll_base: Duration::from_millis(20),
        poll_cap: Duration::from_millis(50),
        backoff_every: 2,
        backoff_factor: 1.5,
        jitter: 0.0,
        max_poll_duration: Duration::from_secs(60),
        max_retries: 1,
        retry_delay: Duration::from_millis(5),
    }
}

async fn wait_for_item_state(queue: &SummaryQueue, episode_id: i64, want: ItemState) {
    for _ in 0..1000 {
        if queue.get(episode_id).map(|i| i.state) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "episode {} never reached {:?} (currently {:?})",
        episode_id,
        want,
        queue.get(episode_id).map(|i| i.state)
    );
}

// =========================================================================
// Interval policy (pure)
// =========================================================================

#[test]
fn base_intervals_are_non_decreasing_up_to_the_cap() {
    let config = SchedulerConfig::default();
    let mut previous = Duration::ZERO;
    for polls in 0..60 {
        let interval = base_poll_interval(&config, polls);
        assert!(
            interval >= previous,
            "interval shrank at poll {}: {:?} < {:?}",
            polls,
            interval,
            previous
        );
        assert!(interval <= config.poll_cap);
        previous = interval;
    }
    assert_eq!(base_poll_interval(&config, 1000), config.poll_cap);
}

#[test]
fn first_interval_is_the_short_initial_poll() {
    let config = SchedulerConfig::default();
    assert_eq!(base_poll_interval(&config, 0), config.initial_poll);
    assert_eq!(base_poll_interval(&config, 1), config.poll_base);
}

#[test]
fn jittered_intervals_stay_within_twenty_percent() {
    let mut rng = rand::thread_rng();
    let base = Duration::from_secs(10);
    for _ in 0..200 {
        let jittered = apply_jitter(base, 0.2, &mut rng);
        assert!(jittered >= Duration::from_secs(8), "{:?} below -20%", jittered);
        assert!(jittered <= Duration::from_secs(12), "{:?} above +20%", jittered);
    }
}

// =========================================================================
// Queue behavior
// =========================================================================

#[tokio::test(start_paused = true)]
async fn double_enqueue_keeps_one_active_item() {
    let api = MockApi::new();
    let queue = SummaryQueue::new(api.clone(), fast_config());

    assert!(queue.enqueue(1, SummaryLevel::Quick));
    assert!(!queue.enqueue(1, SummaryLevel::Quick));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(api.submit_count(), 1);
    assert_eq!(queue.stats().total, 1);
    assert_eq!(queue.items().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn happy_path_reaches_ready_and_counts_completion() {
    let api = MockApi::new();
    api.script_status(
        1,
        vec![
            Ok(transcribing_snap()),
            Ok(summarizing_snap()),
            Ok(ready_snap()),
        ],
    );
    let queue = SummaryQueue::new(api.clone(), fast_config());

    assert!(queue.enqueue(1, SummaryLevel::Quick));
    wait_for_item_state(&queue, 1, ItemState::Ready).await;

    assert_eq!(queue.stats().completed, 1);
    assert_eq!(queue.stats().failed, 0);
    assert_eq!(queue.stats().total, 1);

    // Terminal items stay queryable until explicitly cleared.
    let item = queue.get(1).unwrap();
    assert_eq!(item.state, ItemState::Ready);
    assert!(item.error.is_none());

    queue.clear();
    assert!(queue.get(1).is_none());
    assert_eq!(queue.stats(), SchedulerStats::default());
}

#[tokio::test(start_paused = true)]
async fn repeated_submission_failures_exhaust_retries() {
    let api = MockApi::new();
    api.script_submit(
        2,
        vec![Err("connection reset".to_string()), Err("connection reset".to_string())],
    );
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(2, SummaryLevel::Quick);
    wait_for_item_state(&queue, 2, ItemState::Failed).await;

    let item = queue.get(2).unwrap();
    // MAX_RETRIES = 1: one retry, then permanent failure.
    assert_eq!(item.retry_count, 1);
    assert!(item.error.as_ref().unwrap().contains("Submission failed"));
    assert_eq!(api.submit_count(), 2);
    assert_eq!(queue.stats().failed, 1);
    assert_eq!(queue.stats().completed, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_after_one_failure_can_still_succeed() {
    let api = MockApi::new();
    api.script_submit(
        3,
        vec![Err("blip".to_string()), Ok(transcribing_snap())],
    );
    api.script_status(3, vec![Ok(ready_snap())]);
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(3, SummaryLevel::Quick);
    wait_for_item_state(&queue, 3, ItemState::Ready).await;

    let item = queue.get(3).unwrap();
    assert_eq!(item.retry_count, 1);
    assert_eq!(queue.stats().completed, 1);
    assert_eq!(queue.stats().failed, 0);
}

#[tokio::test(start_paused = true)]
async fn server_reported_failure_follows_retry_policy() {
    let api = MockApi::new();
    // Both attempts observe a terminal failure from the server.
    api.script_status(4, vec![Ok(failed_snap("whisper choked"))]);
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(4, SummaryLevel::Quick);
    wait_for_item_state(&queue, 4, ItemState::Failed).await;

    let item = queue.get(4).unwrap();
    assert_eq!(item.retry_count, 1);
    assert!(item.error.as_ref().unwrap().contains("whisper choked"));
    assert_eq!(api.submit_count(), 2);
    assert_eq!(queue.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn poll_budget_exhaustion_forces_timeout_failure() {
    let api = MockApi::new(); // reports transcribing forever
    let mut config = fast_config();
    config.max_poll_duration = Duration::from_millis(100);
    let queue = SummaryQueue::new(api.clone(), config);

    queue.enqueue(6, SummaryLevel::Quick);
    wait_for_item_state(&queue, 6, ItemState::Failed).await;

    let item = queue.get(6).unwrap();
    assert_eq!(item.error.as_deref(), Some("Processing timed out"));
    // Timeout is not retried: the server never reported failure.
    assert_eq!(api.submit_count(), 1);
    assert_eq!(queue.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn items_process_one_at_a_time_in_fifo_order() {
    let api = MockApi::new();
    api.script_status(
        1,
        vec![Ok(transcribing_snap()), Ok(transcribing_snap()), Ok(ready_snap())],
    );
    api.script_status(2, vec![Ok(ready_snap())]);
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(1, SummaryLevel::Quick);
    queue.enqueue(2, SummaryLevel::Quick);

    tokio::time::sleep(Duration::from_millis(15)).await;
    // Only the first item has dialed the submission endpoint.
    assert_eq!(api.submit_count(), 1);
    assert_eq!(*api.submit_order.lock().unwrap(), vec![1]);

    wait_for_item_state(&queue, 1, ItemState::Ready).await;
    wait_for_item_state(&queue, 2, ItemState::Ready).await;
    assert_eq!(*api.submit_order.lock().unwrap(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn failed_item_can_be_enqueued_again() {
    let api = MockApi::new();
    api.script_submit(
        7,
        vec![
            Err("down".to_string()),
            Err("down".to_string()),
            Ok(transcribing_snap()),
        ],
    );
    api.script_status(7, vec![Ok(ready_snap())]);
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(7, SummaryLevel::Quick);
    wait_for_item_state(&queue, 7, ItemState::Failed).await;

    // The failed item is superseded by a fresh one with a reset counter.
    assert!(queue.enqueue(7, SummaryLevel::Quick));
    wait_for_item_state(&queue, 7, ItemState::Ready).await;
    assert_eq!(queue.get(7).unwrap().retry_count, 0);
    assert_eq!(queue.stats().total, 2);
}

// =========================================================================
// Visibility
// =========================================================================

#[tokio::test(start_paused = true)]
async fn pause_holds_polls_and_resume_fires_immediately() {
    let api = MockApi::new(); // transcribing forever
    let config = SchedulerConfig {
        initial_poll: Duration::from_millis(10),
        poll_base: Duration::from_secs(10),
        poll_cap: Duration::from_secs(10),
        backoff_every: 3,
        backoff_factor: 1.5,
        jitter: 0.0,
        max_poll_duration: Duration::from_secs(3600),
        max_retries: 0,
        retry_delay: Duration::from_millis(5),
    };
    let queue = SummaryQueue::new(api.clone(), config);

    queue.enqueue(1, SummaryLevel::Quick);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let polls_before_pause = api.status_count();
    assert!(polls_before_pause >= 1);

    queue.pause();
    assert!(queue.is_paused());
    // Half a minute of background time: not a single poll fires.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(api.status_count(), polls_before_pause);

    queue.resume();
    // The held poll fires immediately, far sooner than the 10s interval.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.status_count(), polls_before_pause + 1);
}

// =========================================================================
// Resume path / removal / clearing
// =========================================================================

#[tokio::test(start_paused = true)]
async fn attach_joins_polling_without_submitting() {
    let api = MockApi::new();
    api.script_status(9, vec![Ok(transcribing_snap()), Ok(ready_snap())]);
    let queue = SummaryQueue::new(api.clone(), fast_config());

    assert!(queue.attach(9, SummaryLevel::Quick));
    wait_for_item_state(&queue, 9, ItemState::Ready).await;

    assert_eq!(api.submit_count(), 0);
    assert!(api.status_count() >= 2);
    assert_eq!(queue.stats().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn remove_abandons_the_pending_timer() {
    let api = MockApi::new(); // transcribing forever
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(5, SummaryLevel::Quick);
    tokio::time::sleep(Duration::from_millis(40)).await;

    queue.remove(5);
    assert!(queue.get(5).is_none());

    let polls_at_removal = api.status_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(api.status_count(), polls_at_removal);
}

#[tokio::test(start_paused = true)]
async fn clear_drops_terminal_items_but_not_active_work() {
    let api = MockApi::new(); // id 2 stays transcribing forever
    api.script_status(1, vec![Ok(ready_snap())]);
    let queue = SummaryQueue::new(api.clone(), fast_config());

    queue.enqueue(1, SummaryLevel::Quick);
    wait_for_item_state(&queue, 1, ItemState::Ready).await;

    queue.enqueue(2, SummaryLevel::Quick);
    tokio::time::sleep(Duration::from_millis(30)).await;

    queue.clear();

    assert!(queue.get(1).is_none(), "terminal item should be cleared");
    assert!(queue.get(2).is_some(), "active item must survive clear");
    assert_eq!(queue.stats(), SchedulerStats::default());
}
