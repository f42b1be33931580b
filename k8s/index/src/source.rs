use chrono::{DateTime, Duration, Utc};

use podseidon_k8s_api::labels;

use crate::{ResourceId, SharedPodIndex};

/// One pod's contribution to an aggregation.
#[derive(Clone, Debug, PartialEq)]
pub struct PodSample {
    pub uid: String,
    pub scheduled: bool,
    pub running: bool,
    pub ready: bool,
    pub ready_since: Option<DateTime<Utc>>,
}

impl PodSample {
    /// A pod is available once it has been ready for `min_ready_seconds`.
    /// With `min_ready_seconds = 0` a pod that just became ready counts
    /// immediately.
    pub fn is_available(&self, now: DateTime<Utc>, min_ready_seconds: u32) -> bool {
        self.ready
            && self
                .ready_since
                .is_some_and(|since| now - since >= Duration::seconds(i64::from(min_ready_seconds)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The provider's cache has not completed its initial list. An empty
    /// sample set in this state must not be trusted: writing `total = 0`
    /// would prematurely free admission records.
    #[error("pod cache has not completed its initial sync")]
    CacheNotReady,
}

/// Pluggable oracle for the current pod sample set of a protector.
///
/// Implementations may serve a stale view but must be monotonic with respect
/// to the events that triggered the enqueue: once a pod event has been routed
/// into the pending pool, a later `pods` call reflects at least that event.
pub trait SourceProvider: Send + Sync {
    fn pods(
        &self,
        protector: &ResourceId,
        selector: &labels::Selector,
    ) -> Result<Vec<PodSample>, SourceError>;

    /// Lower bound on the freshness of the provider's view. Stamped as the
    /// cell's `lastEventTime` when no samples exist.
    fn sync_time(&self) -> Result<DateTime<Utc>, SourceError>;
}

/// The default provider, backed by this worker cluster's pod informer store.
pub struct CoreSource {
    pods: SharedPodIndex,
}

impl CoreSource {
    pub fn new(pods: SharedPodIndex) -> Self {
        Self { pods }
    }
}

impl SourceProvider for CoreSource {
    fn pods(
        &self,
        protector: &ResourceId,
        selector: &labels::Selector,
    ) -> Result<Vec<PodSample>, SourceError> {
        let pods = self.pods.read();
        if !pods.synced() {
            return Err(SourceError::CacheNotReady);
        }

        Ok(pods
            .pods_in(&protector.namespace)
            .filter(|meta| selector.matches(&meta.labels))
            .map(|meta| PodSample {
                uid: meta.uid.clone(),
                scheduled: meta.scheduled,
                running: meta.running,
                ready: meta.ready,
                ready_since: meta.ready_since,
            })
            .collect())
    }

    fn sync_time(&self) -> Result<DateTime<Utc>, SourceError> {
        let pods = self.pods.read();
        if !pods.synced() {
            return Err(SourceError::CacheNotReady);
        }
        pods.sync_time().ok_or(SourceError::CacheNotReady)
    }
}
