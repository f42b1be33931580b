use ahash::AHashMap as HashMap;
use chrono::{DateTime, DurationRound, Utc};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use podseidon_aggregator_core::worker::{Retry, WorkError};
use podseidon_k8s_api::{
    self as k8s,
    labels::InvalidSelector,
    protector::{AdmissionHistoryConfig, PodProtectorAggregation, IGNORE_LABEL},
    Api, Patch, PatchParams, PodProtector, PodProtectorStatus, Resource, ResourceExt,
};
use podseidon_k8s_index::{
    source::{PodSample, SourceError, SourceProvider},
    ResourceId, SharedProtectorIndex,
};

use crate::{ledger, AggregatorMetrics};

/// Bound on re-read/re-merge cycles before a conflicted write fails the
/// reconcile back into the queue's backoff.
const CONFLICT_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid pod selector: {0}")]
    InvalidSelector(#[from] InvalidSelector),

    #[error("pod source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("status write conflicted {0} times")]
    StaleCache(usize),

    #[error("aggregation rate quota exhausted")]
    QuotaExceeded { retry_after: Duration },

    #[error("api request failed: {0}")]
    Api(#[source] k8s::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WorkError for ReconcileError {
    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSelector(_) => "InvalidSelector",
            Self::SourceUnavailable(_) => "SourceUnavailable",
            Self::StaleCache(_) => "StaleCache",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::Api(_) => "Api",
            Self::Internal(_) => "Internal",
        }
    }

    fn retry(&self) -> Retry {
        match self {
            // Permanent for this generation; the protector watch re-enqueues
            // the key when the spec changes.
            Self::InvalidSelector(_) => Retry::No,
            Self::SourceUnavailable(_) => Retry::Backoff,
            Self::StaleCache(_) => Retry::Backoff,
            Self::QuotaExceeded { retry_after } => Retry::After(*retry_after),
            Self::Api(_) => Retry::Backoff,
            Self::Internal(_) => Retry::No,
        }
    }
}

/// Folds the current pod samples into a fresh cell aggregation.
///
/// `sync_time` seeds `lastEventTime` so that pod deletions and quiet periods
/// advance compaction; a newer ready transition among the samples wins over
/// it. Timestamps are truncated to microseconds, the resolution the ledger
/// compares at.
pub fn fold(
    samples: &[PodSample],
    sync_time: DateTime<Utc>,
    now: DateTime<Utc>,
    min_ready_seconds: u32,
) -> PodProtectorAggregation {
    let mut aggregation = PodProtectorAggregation::default();
    let mut last_event = sync_time;

    for sample in samples {
        aggregation.total_replicas = aggregation.total_replicas.saturating_add(1);
        if sample.scheduled {
            aggregation.scheduled_replicas = aggregation.scheduled_replicas.saturating_add(1);
        }
        if sample.running {
            aggregation.running_replicas = aggregation.running_replicas.saturating_add(1);
        }
        if sample.ready {
            aggregation.ready_replicas = aggregation.ready_replicas.saturating_add(1);
        }
        if sample.is_available(now, min_ready_seconds) {
            aggregation.available_replicas = aggregation.available_replicas.saturating_add(1);
        }
        if let Some(since) = sample.ready_since {
            if since > last_event {
                last_event = since;
            }
        }
    }

    aggregation.last_event_time = Some(micro_time(last_event));
    aggregation
}

/// Builds the status a reconcile would write: this cell replaced wholesale,
/// foreign cells preserved exactly, summary recomputed, own bucket compacted.
/// Pure, so that running it twice over unchanged inputs provably writes the
/// same bytes.
pub fn next_status(
    current: Option<&PodProtectorStatus>,
    aggregation: PodProtectorAggregation,
    cell_id: &str,
    config: &AdmissionHistoryConfig,
) -> (PodProtectorStatus, ledger::CompactStats) {
    let mut status = current.cloned().unwrap_or_default();
    status.set_cell(cell_id, aggregation);
    ledger::summarize(&mut status);
    let stats = ledger::compact(&mut status, cell_id, config);
    (status, stats)
}

fn micro_time(time: DateTime<Utc>) -> k8s::MicroTime {
    k8s::MicroTime(
        time.duration_trunc(chrono::Duration::microseconds(1))
            .unwrap_or(time),
    )
}

/// The reconcile engine for one worker cluster's cell.
pub struct Aggregator {
    client: k8s::Client,
    cell: String,
    protectors: SharedProtectorIndex,
    source: Arc<dyn SourceProvider>,
    metrics: Arc<AggregatorMetrics>,
    last_write: Mutex<HashMap<ResourceId, Instant>>,
}

impl Aggregator {
    pub fn new(
        client: k8s::Client,
        cell: String,
        protectors: SharedProtectorIndex,
        source: Arc<dyn SourceProvider>,
        metrics: Arc<AggregatorMetrics>,
    ) -> Self {
        Self {
            client,
            cell,
            protectors,
            source,
            metrics,
            last_write: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one reconcile for one protector key.
    pub async fn reconcile(&self, id: ResourceId) -> Result<(), ReconcileError> {
        let Some(protector) = self.protectors.read().get(&id) else {
            // Deleted between enqueue and pop.
            return Ok(());
        };
        if is_ignored(&protector) {
            tracing::debug!(protector = %id, "Skipping ignored PodProtector");
            return Ok(());
        }

        let config = &protector.spec.admission_history_config;
        if let Some(retry_after) = self.remaining_quota(&id, config.aggregation_rate()) {
            return Err(ReconcileError::QuotaExceeded { retry_after });
        }

        protector.spec.selector.validate()?;
        let samples = self.source.pods(&id, &protector.spec.selector)?;
        let sync_time = self.source.sync_time()?;
        let aggregation = fold(
            &samples,
            sync_time,
            Utc::now(),
            protector.spec.min_ready_seconds,
        );

        let api = Api::<PodProtector>::namespaced(self.client.clone(), &id.namespace);
        let mut current = (*protector).clone();
        let mut conflicts = 0;
        loop {
            let (status, stats) =
                next_status(current.status.as_ref(), aggregation.clone(), &self.cell, config);
            if stats.forced > 0 {
                self.metrics.observe_forced_compactions(stats.forced);
                tracing::warn!(
                    protector = %id,
                    forced = stats.forced,
                    threshold = config.compact_threshold(),
                    "Admission bucket exceeded its compact threshold",
                );
            }
            if current.status.as_ref() == Some(&status) {
                return Ok(());
            }

            let patch = serde_json::json!({
                "apiVersion": PodProtector::api_version(&()),
                "kind": PodProtector::kind(&()),
                "metadata": { "resourceVersion": current.resource_version() },
                "status": status,
            });
            match api
                .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {
                    self.last_write.lock().insert(id.clone(), Instant::now());
                    tracing::debug!(
                        protector = %id,
                        available = aggregation.available_replicas,
                        total = aggregation.total_replicas,
                        "Wrote aggregation",
                    );
                    return Ok(());
                }
                Err(k8s::Error::Api(response)) if response.code == 404 => {
                    // Deletion race with the central cluster.
                    return Ok(());
                }
                Err(k8s::Error::Api(response)) if response.code == 409 => {
                    conflicts += 1;
                    if conflicts >= CONFLICT_RETRIES {
                        return Err(ReconcileError::StaleCache(conflicts));
                    }
                    current = match api.get(&id.name).await {
                        Ok(current) => current,
                        Err(k8s::Error::Api(response)) if response.code == 404 => return Ok(()),
                        Err(error) => return Err(ReconcileError::Api(error)),
                    };
                }
                Err(error) => return Err(ReconcileError::Api(error)),
            }
        }
    }

    fn remaining_quota(&self, id: &ResourceId, rate: Duration) -> Option<Duration> {
        let last_write = self.last_write.lock();
        let remaining = rate.checked_sub(last_write.get(id)?.elapsed())?;
        (!remaining.is_zero()).then_some(remaining)
    }
}

fn is_ignored(protector: &PodProtector) -> bool {
    protector
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(IGNORE_LABEL))
        .map(String::as_str)
        == Some("true")
}
