//! Admission control for outgoing work.
//!
//! The queue is the single point every long-running operation passes
//! through. It enforces:
//!
//! - **Strict priority**: level 0 is drained before level 1 is considered,
//!   FIFO within a level.
//! - **Bounded concurrency**: at most `max_concurrent` operations are active.
//! - **Dispatch spacing**: consecutive dispatches are at least `min_spacing`
//!   apart, across all levels.
//! - **Retry**: retryable failures give their slot back, wait out the
//!   backoff from [`RetryPolicy`], and are re-admitted at the same level.
//!
//! The caller's future owns the operation; the queue only hands out
//! admission slots. A slot is returned when it is dropped, which also
//! admits the next waiter.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::retry::{RetryPolicy, with_timeout};

/// Configuration for the request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of strict priority levels (0 is highest).
    pub priority_levels: usize,
    pub max_concurrent: usize,
    /// Minimum gap between two dispatches.
    pub min_spacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_levels: 3,
            max_concurrent: 3,
            min_spacing: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }

    pub fn with_priority_levels(mut self, levels: usize) -> Self {
        self.priority_levels = levels.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Caller-supplied metadata carried with a request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub label: String,
    pub source_id: Option<String>,
    /// Deadline for a single attempt.
    pub timeout: Option<Duration>,
    /// Overrides the queue's retry budget for this request.
    pub max_retries: Option<u32>,
}

impl RequestContext {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn for_source(source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            label: format!("scrape:{source_id}"),
            source_id: Some(source_id),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

/// A request waiting for, or holding, an admission slot.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub priority: usize,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub context: RequestContext,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub active: usize,
    /// Waiting requests per priority level.
    pub queued: Vec<usize>,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

impl QueueStatus {
    pub fn total_queued(&self) -> usize {
        self.queued.iter().sum()
    }
}

struct Waiting {
    request: QueuedRequest,
    admit: oneshot::Sender<Slot>,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    completed: u64,
    failed: u64,
    retried: u64,
}

struct QueueState {
    levels: Vec<VecDeque<Waiting>>,
    active: usize,
    last_dispatch: Option<Instant>,
    timer_armed: bool,
    counters: Counters,
}

impl QueueState {
    fn pop_next(&mut self) -> Option<Waiting> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    fn has_waiting(&self) -> bool {
        self.levels.iter().any(|level| !level.is_empty())
    }
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl Shared {
    /// Acquires the state lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned queue mutex");
            poisoned.into_inner()
        })
    }

    /// Admit as many waiters as the concurrency bound and spacing allow.
    fn pump(self: &Arc<Self>) {
        let mut state = self.lock();
        while state.active < self.config.max_concurrent {
            let now = Instant::now();
            if let Some(last) = state.last_dispatch {
                let ready_at = last + self.config.min_spacing;
                if now < ready_at {
                    if state.has_waiting() {
                        self.arm_timer(&mut state, ready_at - now);
                    }
                    return;
                }
            }

            let Some(next) = state.pop_next() else {
                return;
            };

            state.active += 1;
            let slot = Slot {
                shared: Arc::clone(self),
                armed: true,
            };
            match next.admit.send(slot) {
                Ok(()) => {
                    state.last_dispatch = Some(now);
                    tracing::trace!(
                        request_id = %next.request.id,
                        priority = next.request.priority,
                        retry = next.request.retry_count,
                        waited_ms = now.duration_since(next.request.enqueued_at).as_millis() as u64,
                        label = %next.request.context.label,
                        "Request admitted"
                    );
                }
                Err(mut slot) => {
                    // Caller went away while waiting.
                    slot.armed = false;
                    state.active -= 1;
                }
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut QueueState, wait: Duration) {
        if state.timer_armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.timer_armed = true;
        let shared = Arc::clone(self);
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            shared.lock().timer_armed = false;
            shared.pump();
        });
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.pump();
    }
}

/// An admission slot. Dropping it frees the slot and admits the next waiter.
struct Slot {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release();
        }
    }
}

/// Priority/throttling request queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = QueueConfig {
            priority_levels: config.priority_levels.max(1),
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };
        let levels = (0..config.priority_levels).map(|_| VecDeque::new()).collect();
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    levels,
                    active: 0,
                    last_dispatch: None,
                    timer_armed: false,
                    counters: Counters::default(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Clamp a requested level into the configured range.
    pub fn level(&self, priority: usize) -> usize {
        priority.min(self.shared.config.priority_levels - 1)
    }

    /// Run `operation` once admitted, retrying retryable failures.
    ///
    /// The result, or the final classified error, goes only to this caller.
    pub async fn enqueue<T, F, Fut>(
        &self,
        mut operation: F,
        priority: usize,
        context: RequestContext,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_retries = context
            .max_retries
            .unwrap_or(self.shared.config.retry.max_retries);
        let mut request = QueuedRequest {
            id: Uuid::new_v4(),
            priority: self.level(priority),
            enqueued_at: Instant::now(),
            retry_count: 0,
            context,
        };
        self.shared.lock().counters.enqueued += 1;

        loop {
            let slot = self.admit(&request).await?;
            let outcome = match request.context.timeout {
                Some(limit) => with_timeout(limit, operation()).await,
                None => operation().await,
            };
            drop(slot);

            match outcome {
                Ok(value) => {
                    self.shared.lock().counters.completed += 1;
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && request.retry_count < max_retries => {
                    let delay = self
                        .shared
                        .config
                        .retry
                        .delay_for_error(request.retry_count, &e);
                    tracing::debug!(
                        request_id = %request.id,
                        label = %request.context.label,
                        attempt = request.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, requeueing after backoff"
                    );
                    self.shared.lock().counters.retried += 1;
                    request.retry_count += 1;
                    tokio::time::sleep(delay).await;
                    request.enqueued_at = Instant::now();
                }
                Err(e) => {
                    self.shared.lock().counters.failed += 1;
                    let attempts = request.retry_count + 1;
                    return Err(if e.is_retryable() {
                        e.into_final(attempts)
                    } else {
                        e
                    });
                }
            }
        }
    }

    async fn admit(&self, request: &QueuedRequest) -> Result<Slot, AppError> {
        let (tx, rx) = oneshot::channel();
        self.shared.lock().levels[request.priority].push_back(Waiting {
            request: request.clone(),
            admit: tx,
        });
        self.shared.pump();
        rx.await.map_err(|_| AppError::Cancelled)
    }

    /// Group `items` by key, split each group into chunks of `batch_size`,
    /// and run `processor` once per chunk through the queue.
    ///
    /// Results come back in chunk order: groups in first-seen key order,
    /// chunks in item order within a group.
    pub async fn batch<T, K, R, KF, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        options: BatchOptions<KF>,
    ) -> Vec<Result<R, AppError>>
    where
        T: Clone,
        K: Eq + Hash + Clone,
        KF: Fn(&T) -> K,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, AppError>>,
    {
        let batch_size = options.batch_size.max(1);
        let mut order: Vec<K> = Vec::new();
        let mut groups: HashMap<K, Vec<T>> = HashMap::new();
        for item in items {
            let key = (options.key_extractor)(&item);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(item);
        }

        let chunks: Vec<Vec<T>> = order
            .iter()
            .filter_map(|key| groups.remove(key))
            .flat_map(|group| {
                group
                    .chunks(batch_size)
                    .map(<[T]>::to_vec)
                    .collect::<Vec<_>>()
            })
            .collect();

        tracing::debug!(chunks = chunks.len(), batch_size, "Dispatching batch");

        let processor = &processor;
        let calls = chunks.into_iter().enumerate().map(|(index, chunk)| {
            self.enqueue(
                move || processor(chunk.clone()),
                options.priority,
                RequestContext::labeled(format!("batch:{index}")),
            )
        });
        futures::future::join_all(calls).await
    }

    /// A debouncer whose calls run through this queue.
    pub fn debounce(&self, delay: Duration) -> Debouncer {
        Debouncer {
            queue: self.clone(),
            delay,
            priority: 0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Drop every waiting request; their callers receive [`AppError::Cancelled`].
    pub fn clear(&self) -> usize {
        let mut state = self.shared.lock();
        let mut dropped = 0;
        for level in state.levels.iter_mut() {
            dropped += level.len();
            level.clear();
        }
        if dropped > 0 {
            tracing::info!(dropped, "Cleared waiting requests");
        }
        dropped
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.lock();
        QueueStatus {
            active: state.active,
            queued: state.levels.iter().map(VecDeque::len).collect(),
            enqueued: state.counters.enqueued,
            completed: state.counters.completed,
            failed: state.counters.failed,
            retried: state.counters.retried,
        }
    }
}

/// Options for [`RequestQueue::batch`].
#[derive(Debug, Clone)]
pub struct BatchOptions<KF> {
    pub batch_size: usize,
    pub priority: usize,
    pub key_extractor: KF,
}

impl<KF> BatchOptions<KF> {
    pub fn new(batch_size: usize, key_extractor: KF) -> Self {
        Self {
            batch_size,
            priority: 1,
            key_extractor,
        }
    }

    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }
}

/// Collapses rapid repeated calls into the most recent one.
///
/// Each call waits `delay`; if a newer call arrived meanwhile, the older one
/// fails with [`AppError::Superseded`] instead of running.
#[derive(Clone)]
pub struct Debouncer {
    queue: RequestQueue,
    delay: Duration,
    priority: usize,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.generation.load(Ordering::SeqCst) != ticket {
            return Err(AppError::Superseded);
        }
        self.queue
            .enqueue(operation, self.priority, RequestContext::labeled("debounced"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use super::*;

    fn fast_config(max_concurrent: usize) -> QueueConfig {
        QueueConfig::default()
            .with_max_concurrent(max_concurrent)
            .with_min_spacing(Duration::ZERO)
            .with_retry(
                RetryPolicy::new(2)
                    .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
            )
    }

    async fn wait_for_queued(queue: &RequestQueue, expected: usize) {
        for _ in 0..1000 {
            if queue.status().total_queued() == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {expected} waiting requests");
    }

    #[tokio::test]
    async fn test_enqueue_returns_operation_result() {
        let queue = RequestQueue::new(fast_config(3));
        let value = queue
            .enqueue(|| async { Ok::<_, AppError>(5) }, 0, RequestContext::default())
            .await
            .unwrap();
        assert_eq!(value, 5);

        let status = queue.status();
        assert_eq!(status.enqueued, 1);
        assert_eq!(status.completed, 1);
        assert_eq!(status.active, 0);
    }

    #[tokio::test]
    async fn test_higher_priority_admitted_first_when_slot_frees() {
        let queue = RequestQueue::new(fast_config(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupy the only slot.
        let blocker = {
            let queue = queue.clone();
            let mut release = Some(release_rx);
            tokio::spawn(async move {
                queue
                    .enqueue(
                        move || {
                            let rx = release.take();
                            async move {
                                if let Some(rx) = rx {
                                    let _ = rx.await;
                                }
                                Ok::<_, AppError>(())
                            }
                        },
                        0,
                        RequestContext::labeled("blocker"),
                    )
                    .await
            })
        };
        while queue.status().active == 0 {
            tokio::task::yield_now().await;
        }

        let spawn_recorded = |label: &'static str, priority: usize| {
            let queue = queue.clone();
            let order = order.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        || {
                            let order = order.clone();
                            async move {
                                order.lock().unwrap().push(label);
                                Ok::<_, AppError>(())
                            }
                        },
                        priority,
                        RequestContext::labeled(label),
                    )
                    .await
            })
        };

        let low = spawn_recorded("low", 1);
        wait_for_queued(&queue, 1).await;
        let high = spawn_recorded("high", 0);
        wait_for_queued(&queue, 2).await;

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        low.await.unwrap().unwrap();
        high.await.unwrap().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_fifo_within_level() {
        let queue = RequestQueue::new(fast_config(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..5).map(|i| {
            let order = order.clone();
            queue.enqueue(
                move || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, AppError>(())
                    }
                },
                1,
                RequestContext::default(),
            )
        });
        futures::future::join_all(calls).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let queue = RequestQueue::new(fast_config(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..8).map(|_| {
            let active = active.clone();
            let peak = peak.clone();
            queue.enqueue(
                move || {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, AppError>(())
                    }
                },
                0,
                RequestContext::default(),
            )
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.status().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_are_spaced() {
        let queue = RequestQueue::new(
            fast_config(3).with_min_spacing(Duration::from_millis(100)),
        );
        let starts = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..3).map(|_| {
            let starts = starts.clone();
            queue.enqueue(
                move || {
                    let starts = starts.clone();
                    async move {
                        starts.lock().unwrap().push(Instant::now());
                        Ok::<_, AppError>(())
                    }
                },
                0,
                RequestContext::default(),
            )
        });
        futures::future::join_all(calls).await;

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let queue = RequestQueue::new(fast_config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = queue
            .enqueue(
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(AppError::from_status(429, "https://example.com", None))
                        } else {
                            Ok("second time lucky")
                        }
                    }
                },
                0,
                RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(value, "second time lucky");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.status().retried, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_rejects_immediately() {
        let queue = RequestQueue::new(fast_config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = queue
            .enqueue(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(AppError::from_status(404, "https://example.com", None))
                    }
                },
                0,
                RequestContext::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AppError::ClientError { status: 404, .. }));
        assert_eq!(queue.status().failed, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_final_error() {
        let queue = RequestQueue::new(fast_config(1));
        let err = queue
            .enqueue(
                || async { Err::<(), _>(AppError::NetworkError("down".into())) },
                0,
                RequestContext::default().with_max_retries(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_request_timeout() {
        let queue = RequestQueue::new(fast_config(1));
        let err = queue
            .enqueue(
                || std::future::pending::<Result<(), AppError>>(),
                0,
                RequestContext::default()
                    .with_timeout(Duration::from_millis(50))
                    .with_max_retries(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::RetriesExhausted { ref source, .. } if matches!(**source, AppError::Timeout(_))
        ));
        assert_eq!(queue.status().active, 0);
    }

    #[tokio::test]
    async fn test_batch_groups_by_key_and_chunks() {
        let queue = RequestQueue::new(fast_config(2));
        let items = vec![("a", 1), ("b", 2), ("a", 3), ("a", 4), ("b", 5)];

        let results = queue
            .batch(
                items,
                |chunk: Vec<(&str, i32)>| async move {
                    Ok::<_, AppError>(chunk.iter().map(|(_, v)| *v).collect::<Vec<_>>())
                },
                BatchOptions::new(2, |item: &(&'static str, i32)| item.0),
            )
            .await;

        let chunks: Vec<Vec<i32>> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![vec![1, 3], vec![4], vec![2, 5]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_supersedes_earlier_calls() {
        let queue = RequestQueue::new(fast_config(1));
        let debouncer = queue.debounce(Duration::from_millis(100));

        let first = {
            let debouncer = debouncer.clone();
            tokio::spawn(async move { debouncer.call(|| async { Ok::<_, AppError>(1) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let debouncer = debouncer.clone();
            tokio::spawn(async move { debouncer.call(|| async { Ok::<_, AppError>(2) }).await })
        };

        assert!(matches!(first.await.unwrap(), Err(AppError::Superseded)));
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear_cancels_waiters() {
        let queue = RequestQueue::new(fast_config(1));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let mut release = Some(release_rx);

        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        move || {
                            let rx = release.take();
                            async move {
                                if let Some(rx) = rx {
                                    let _ = rx.await;
                                }
                                Ok::<_, AppError>(())
                            }
                        },
                        0,
                        RequestContext::default(),
                    )
                    .await
            })
        };
        while queue.status().active == 0 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(|| async { Ok::<_, AppError>(()) }, 2, RequestContext::default())
                    .await
            })
        };
        wait_for_queued(&queue, 1).await;

        assert_eq!(queue.clear(), 1);
        assert!(matches!(waiter.await.unwrap(), Err(AppError::Cancelled)));

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
    }

    #[test]
    fn test_level_is_clamped() {
        let queue = RequestQueue::new(QueueConfig::default().with_priority_levels(3));
        assert_eq!(queue.level(0), 0);
        assert_eq!(queue.level(2), 2);
        assert_eq!(queue.level(99), 2);
    }
}
