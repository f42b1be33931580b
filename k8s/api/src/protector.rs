use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::labels;

/// A `PodProtector` labeled with this key (value `"true"`) is skipped by the
/// aggregator. Used operationally to quarantine a misbehaving object.
pub const IGNORE_LABEL: &str = "aggregator-ignore-ppr";

const DEFAULT_COMPACT_THRESHOLD: u32 = 100;
const DEFAULT_AGGREGATION_RATE_MILLIS: u32 = 1000;

/// Declares a deletion-admission quota over a selected set of pods.
///
/// Pods for a single workload may be spread over multiple worker clusters;
/// each cluster's aggregator reports its availability counts into one cell of
/// the status, and each cluster's webhook admits pod deletions against the
/// summary and the admission-history ledger.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "podseidon.kubewharf.io",
    version = "v1alpha1",
    kind = "PodProtector",
    status = "PodProtectorStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodProtectorSpec {
    /// Selects the pods this protector governs, within its own namespace.
    pub selector: labels::Selector,

    /// The number of available replicas the webhook must preserve.
    #[serde(default)]
    pub min_available: u32,

    /// A pod counts as available only once it has been ready for at least
    /// this many seconds.
    #[serde(default)]
    pub min_ready_seconds: u32,

    #[serde(default)]
    pub admission_history_config: AdmissionHistoryConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionHistoryConfig {
    /// Cap on admitted deletions not yet reflected in aggregation, across all
    /// cells. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_lag: Option<u32>,

    /// Maximum admission-history records retained per cell after a reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compact_threshold: Option<u32>,

    /// Minimum period between successive status writes for this protector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_rate_millis: Option<u32>,
}

impl AdmissionHistoryConfig {
    pub fn compact_threshold(&self) -> usize {
        self.compact_threshold.unwrap_or(DEFAULT_COMPACT_THRESHOLD) as usize
    }

    pub fn aggregation_rate(&self) -> Duration {
        Duration::from_millis(u64::from(
            self.aggregation_rate_millis
                .unwrap_or(DEFAULT_AGGREGATION_RATE_MILLIS),
        ))
    }

    pub fn max_concurrent_lag(&self) -> Option<usize> {
        self.max_concurrent_lag.map(|lag| lag as usize)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodProtectorStatus {
    /// The pointwise sum of all cells.
    #[serde(default)]
    pub summary: PodProtectorAggregation,

    /// Per-worker-cluster aggregations, keyed and sorted by `cellId`.
    #[serde(default)]
    pub cells: Vec<PodProtectorCellStatus>,

    #[serde(default)]
    pub admission_history: AdmissionHistory,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodProtectorCellStatus {
    pub cell_id: String,

    #[serde(default)]
    pub aggregation: PodProtectorAggregation,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodProtectorAggregation {
    #[serde(default)]
    pub total_replicas: u32,

    #[serde(default)]
    pub scheduled_replicas: u32,

    #[serde(default)]
    pub running_replicas: u32,

    #[serde(default)]
    pub ready_replicas: u32,

    #[serde(default)]
    pub available_replicas: u32,

    /// Timestamp of the newest pod event folded into this snapshot,
    /// microsecond resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<MicroTime>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionHistory {
    /// Admitted-but-unconfirmed deletions, keyed and sorted by `cellId`.
    #[serde(default)]
    pub buckets: Vec<AdmissionBucket>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionBucket {
    pub cell_id: String,

    #[serde(default)]
    pub records: Vec<AdmissionRecord>,
}

/// Records one webhook-admitted deletion that aggregation has not yet been
/// observed to reflect. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRecord {
    pub uid: String,

    pub deletion_timestamp: MicroTime,
}

// === PodProtectorAggregation ===

impl PodProtectorAggregation {
    /// Folds another cell's counts into this aggregation. Counts saturate;
    /// `last_event_time` takes the later of the two.
    pub fn accumulate(&mut self, other: &Self) {
        self.total_replicas = self.total_replicas.saturating_add(other.total_replicas);
        self.scheduled_replicas = self
            .scheduled_replicas
            .saturating_add(other.scheduled_replicas);
        self.running_replicas = self.running_replicas.saturating_add(other.running_replicas);
        self.ready_replicas = self.ready_replicas.saturating_add(other.ready_replicas);
        self.available_replicas = self
            .available_replicas
            .saturating_add(other.available_replicas);

        if let Some(time) = other.last_event_time.as_ref() {
            if self
                .last_event_time
                .as_ref()
                .is_none_or(|current| current.0 < time.0)
            {
                self.last_event_time = Some(time.clone());
            }
        }
    }
}

// === PodProtectorStatus ===

impl PodProtectorStatus {
    pub fn cell(&self, cell_id: &str) -> Option<&PodProtectorCellStatus> {
        self.cells.iter().find(|c| c.cell_id == cell_id)
    }

    /// Replaces this cell's aggregation wholesale, preserving all other cells.
    /// Cells stay sorted by `cellId` so that repeated reconciles produce
    /// byte-identical statuses.
    pub fn set_cell(&mut self, cell_id: &str, aggregation: PodProtectorAggregation) {
        match self.cells.iter_mut().find(|c| c.cell_id == cell_id) {
            Some(cell) => cell.aggregation = aggregation,
            None => {
                self.cells.push(PodProtectorCellStatus {
                    cell_id: cell_id.to_string(),
                    aggregation,
                });
                self.cells.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
            }
        }
    }

    pub fn bucket(&self, cell_id: &str) -> Option<&AdmissionBucket> {
        self.admission_history
            .buckets
            .iter()
            .find(|b| b.cell_id == cell_id)
    }

    /// Returns this cell's bucket, creating an empty one in `cellId` order if
    /// it does not exist yet.
    pub fn bucket_mut(&mut self, cell_id: &str) -> &mut AdmissionBucket {
        let buckets = &mut self.admission_history.buckets;
        if let Some(pos) = buckets.iter().position(|b| b.cell_id == cell_id) {
            return &mut buckets[pos];
        }
        buckets.push(AdmissionBucket {
            cell_id: cell_id.to_string(),
            records: Vec::new(),
        });
        buckets.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
        let pos = buckets
            .iter()
            .position(|b| b.cell_id == cell_id)
            .expect("bucket was just inserted");
        &mut buckets[pos]
    }

    /// Drops buckets that no longer hold any records.
    pub fn prune_empty_buckets(&mut self) {
        self.admission_history
            .buckets
            .retain(|b| !b.records.is_empty());
    }
}

// === AdmissionHistory ===

impl AdmissionHistory {
    /// Total admitted-but-unconfirmed deletions across all cells.
    pub fn total_records(&self) -> usize {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn micro(secs: i64) -> MicroTime {
        MicroTime(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn accumulate_sums_counts_and_takes_latest_event() {
        let mut sum = PodProtectorAggregation::default();
        sum.accumulate(&PodProtectorAggregation {
            total_replicas: 3,
            scheduled_replicas: 3,
            running_replicas: 3,
            ready_replicas: 3,
            available_replicas: 3,
            last_event_time: Some(micro(100)),
        });
        sum.accumulate(&PodProtectorAggregation {
            total_replicas: 4,
            scheduled_replicas: 4,
            running_replicas: 4,
            ready_replicas: 4,
            available_replicas: 4,
            last_event_time: Some(micro(50)),
        });

        assert_eq!(sum.total_replicas, 7);
        assert_eq!(sum.available_replicas, 7);
        assert_eq!(sum.last_event_time, Some(micro(100)));
    }

    #[test]
    fn accumulate_saturates() {
        let mut sum = PodProtectorAggregation {
            total_replicas: u32::MAX - 1,
            ..Default::default()
        };
        sum.accumulate(&PodProtectorAggregation {
            total_replicas: 5,
            ..Default::default()
        });
        assert_eq!(sum.total_replicas, u32::MAX);
    }

    #[test]
    fn set_cell_replaces_wholesale_and_keeps_order() {
        let mut status = PodProtectorStatus::default();
        status.set_cell(
            "worker-2",
            PodProtectorAggregation {
                total_replicas: 4,
                ..Default::default()
            },
        );
        status.set_cell(
            "worker-1",
            PodProtectorAggregation {
                total_replicas: 3,
                ..Default::default()
            },
        );
        status.set_cell(
            "worker-2",
            PodProtectorAggregation {
                total_replicas: 5,
                ..Default::default()
            },
        );

        let ids: Vec<_> = status.cells.iter().map(|c| c.cell_id.as_str()).collect();
        assert_eq!(ids, vec!["worker-1", "worker-2"]);
        assert_eq!(status.cell("worker-2").unwrap().aggregation.total_replicas, 5);
    }

    #[test]
    fn config_defaults() {
        let config = AdmissionHistoryConfig::default();
        assert_eq!(config.compact_threshold(), 100);
        assert_eq!(config.aggregation_rate(), Duration::from_millis(1000));
        assert_eq!(config.max_concurrent_lag(), None);
    }
}
