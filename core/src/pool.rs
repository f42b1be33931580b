use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{
    hash::Hash,
    time::{Duration, Instant},
};

/// Coalesces bursts of per-object events into batched work.
///
/// Pod events route each matching protector key into the pool; a drain timer
/// empties the whole pool at a fixed cadence and enqueues one reconcile per
/// key, no matter how many pod events arrived in between.
pub struct PendingPool<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    last_drain: Option<Instant>,
}

struct Entry<V> {
    first_enqueue: Instant,
    items: HashSet<V>,
}

/// Observability snapshot reported by each drain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Number of keys removed by this drain.
    pub size: usize,

    /// Age of the oldest entry at drain time.
    pub oldest: Option<Duration>,

    /// Time since the previous drain, absent on the first.
    pub since_last_drain: Option<Duration>,
}

impl<K, V> Default for PendingPool<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_drain: None,
            }),
        }
    }
}

impl<K: Eq + Hash, V: Eq + Hash> PendingPool<K, V> {
    /// Inserts an item under a key. The key's `first_enqueue` is recorded on
    /// first insertion and kept until the next drain.
    pub fn add(&self, key: K, item: V, now: Instant) {
        let mut inner = self.inner.lock();
        inner
            .entries
            .entry(key)
            .or_insert_with(|| Entry {
                first_enqueue: now,
                items: HashSet::new(),
            })
            .items
            .insert(item);
    }

    /// Atomically removes and returns every entry.
    pub fn drain(&self, now: Instant) -> (Vec<(K, HashSet<V>)>, DrainStats) {
        let mut inner = self.inner.lock();

        let oldest = inner
            .entries
            .values()
            .map(|e| e.first_enqueue)
            .min()
            .map(|first| now.saturating_duration_since(first));
        let since_last_drain = inner
            .last_drain
            .map(|last| now.saturating_duration_since(last));
        inner.last_drain = Some(now);

        let entries: Vec<_> = inner
            .entries
            .drain()
            .map(|(key, entry)| (key, entry.items))
            .collect();

        let stats = DrainStats {
            size: entries.len(),
            oldest,
            since_last_drain,
        };
        (entries, stats)
    }

    /// Number of keys currently pending. Sampled by a periodic gauge.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the oldest pending entry. Sampled by a periodic gauge.
    pub fn oldest_latency(&self, now: Instant) -> Option<Duration> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.first_enqueue)
            .min()
            .map(|first| now.saturating_duration_since(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_coalesces_per_key() {
        let pool = PendingPool::default();
        let t0 = Instant::now();

        pool.add("protector-a", "pod-0", t0);
        pool.add("protector-a", "pod-0", t0 + Duration::from_millis(10));
        pool.add("protector-a", "pod-1", t0 + Duration::from_millis(20));
        pool.add("protector-b", "pod-2", t0 + Duration::from_millis(30));
        assert_eq!(pool.len(), 2);

        let (entries, stats) = pool.drain(t0 + Duration::from_millis(100));
        assert_eq!(stats.size, 2);
        assert_eq!(stats.oldest, Some(Duration::from_millis(100)));
        assert_eq!(stats.since_last_drain, None);

        let a = entries
            .iter()
            .find(|(key, _)| *key == "protector-a")
            .unwrap();
        assert_eq!(a.1.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn drain_of_empty_pool_reports_zero_size() {
        let pool = PendingPool::<&str, &str>::default();
        let t0 = Instant::now();

        let (entries, stats) = pool.drain(t0);
        assert!(entries.is_empty());
        assert_eq!(
            stats,
            DrainStats {
                size: 0,
                oldest: None,
                since_last_drain: None,
            },
        );

        let (_, stats) = pool.drain(t0 + Duration::from_secs(1));
        assert_eq!(stats.since_last_drain, Some(Duration::from_secs(1)));
    }

    #[test]
    fn first_enqueue_survives_later_adds() {
        let pool = PendingPool::default();
        let t0 = Instant::now();

        pool.add("protector-a", "pod-0", t0);
        pool.add("protector-a", "pod-1", t0 + Duration::from_secs(5));

        assert_eq!(
            pool.oldest_latency(t0 + Duration::from_secs(6)),
            Some(Duration::from_secs(6)),
        );
    }
}
