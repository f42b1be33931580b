use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Notify;

/// An error returned by a reconcile function, classified for retry policy and
/// metrics tagging.
pub trait WorkError: fmt::Display {
    /// Stable tag identifying the error kind, used as a metric label.
    fn kind(&self) -> &'static str;

    fn retry(&self) -> Retry;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Retry {
    /// Permanent for the current inputs; the key is retried only when a new
    /// event re-enqueues it.
    No,

    /// Transient; requeue with per-key exponential backoff.
    Backoff,

    /// Requeue after exactly this delay, without advancing the backoff.
    After(Duration),
}

/// Observability hook invoked once per reconcile attempt.
pub trait Observe: Send + Sync {
    fn reconciled(&self, queue: &'static str, outcome: &'static str, elapsed: Duration);
}

impl Observe for () {
    fn reconciled(&self, _: &'static str, _: &'static str, _: Duration) {}
}

#[derive(Copy, Clone, Debug)]
pub struct QueueParams {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A name-keyed work queue with per-key deduplication.
///
/// A key enqueued while its reconcile is in flight is marked dirty and runs
/// exactly once more after the current attempt completes, so writers never
/// race on the same key and bursty triggers coalesce. Failed attempts are
/// requeued according to the error's [`Retry`] policy.
pub struct Queue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Queue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<K> {
    name: &'static str,
    params: QueueParams,
    notify: Notify,
    observer: Arc<dyn Observe>,
    state: Mutex<State<K>>,
}

struct State<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    attempts: HashMap<K, u32>,
    closed: bool,
}

impl<K> Queue<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str, params: QueueParams, observer: Arc<dyn Observe>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                params,
                notify: Notify::new(),
                observer,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    queued: HashSet::new(),
                    processing: HashSet::new(),
                    dirty: HashSet::new(),
                    attempts: HashMap::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Enqueues a key. No-op if the key is already pending; if the key is
    /// being processed, it is re-run once after the current attempt.
    pub fn enqueue(&self, key: K) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    pub fn enqueue_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Runs `workers` consumers until shutdown is signaled. New work is
    /// refused as soon as the signal fires; in-flight reconciles complete
    /// before the drain handle is released.
    pub async fn run<F, Fut, E>(&self, workers: usize, reconcile: F, shutdown: drain::Watch)
    where
        F: Fn(K) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: WorkError + Send + 'static,
    {
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..workers.max(1) {
            let queue = self.clone();
            let reconcile = reconcile.clone();
            tasks.spawn(async move {
                while let Some(key) = queue.next().await {
                    let start = Instant::now();
                    let result = reconcile(key.clone()).await;
                    let outcome = match &result {
                        Ok(()) => "ok",
                        Err(error) => error.kind(),
                    };
                    queue
                        .shared
                        .observer
                        .reconciled(queue.shared.name, outcome, start.elapsed());
                    queue.complete(key, result);
                }
            });
        }

        let release = shutdown.signaled().await;
        tracing::debug!(queue = %self.shared.name, "Shutting down");
        self.close();
        release
            .release_after(async move { while tasks.join_next().await.is_some() {} })
            .await;
    }

    fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    async fn next(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    // A single Notify permit may be outstanding for several
                    // queued keys; chain the wakeup to the next consumer.
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    fn complete<E: WorkError>(&self, key: K, result: Result<(), E>) {
        let requeue_after = {
            let mut state = self.shared.state.lock();
            state.processing.remove(&key);
            let was_dirty = state.dirty.remove(&key);

            match result {
                Ok(()) => {
                    state.attempts.remove(&key);
                    was_dirty.then_some(Duration::ZERO)
                }
                Err(error) if was_dirty => {
                    // New inputs arrived during the failed attempt; retry now
                    // with a fresh backoff budget.
                    tracing::debug!(queue = %self.shared.name, ?key, %error, "Retrying with new inputs");
                    state.attempts.remove(&key);
                    Some(Duration::ZERO)
                }
                Err(error) => match error.retry() {
                    Retry::No => {
                        tracing::warn!(queue = %self.shared.name, ?key, %error, "Giving up");
                        state.attempts.remove(&key);
                        None
                    }
                    Retry::After(delay) => {
                        tracing::debug!(queue = %self.shared.name, ?key, %error, ?delay, "Requeueing");
                        Some(delay)
                    }
                    Retry::Backoff => {
                        let attempts = state.attempts.entry(key.clone()).or_insert(0);
                        *attempts += 1;
                        let exp = attempts.saturating_sub(1).min(16);
                        let delay = self
                            .shared
                            .params
                            .initial_backoff
                            .saturating_mul(2u32.saturating_pow(exp))
                            .min(self.shared.params.max_backoff);
                        tracing::debug!(queue = %self.shared.name, ?key, %error, ?delay, "Backing off");
                        Some(delay)
                    }
                },
            }
        };

        if let Some(delay) = requeue_after {
            if delay.is_zero() {
                self.enqueue(key);
            } else {
                self.enqueue_after(key, delay);
            }
        }
    }
}
