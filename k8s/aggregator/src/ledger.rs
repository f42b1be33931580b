//! Operations on the admission-history ledger.
//!
//! The ledger is multi-writer: each worker cluster's webhook appends records
//! to its own bucket at admit time, and each cluster's aggregator compacts
//! its own bucket once aggregation has observed the corresponding deletions.
//! Neither side ever touches a bucket it does not own, which is what keeps
//! conflict-retried merges field-scoped instead of blind overwrites.

use podseidon_k8s_api::{
    protector::{AdmissionHistoryConfig, AdmissionRecord, PodProtectorAggregation},
    MicroTime, PodProtectorStatus,
};

/// Recomputes `status.summary` as the pointwise sum of all cells.
pub fn summarize(status: &mut PodProtectorStatus) {
    let mut summary = PodProtectorAggregation::default();
    for cell in &status.cells {
        summary.accumulate(&cell.aggregation);
    }
    status.summary = summary;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactStats {
    /// Records dropped because aggregation already observed their deletion.
    pub aged_out: usize,

    /// Records dropped by the `compactThreshold` safety valve. Normally zero;
    /// nonzero values deserve a metric and a warning.
    pub forced: usize,
}

/// Compacts one cell's bucket against that cell's aggregation.
///
/// A record with `deletionTimestamp <= lastEventTime` is already reflected in
/// the cell's counts, so keeping it would double-count the deletion against
/// the quota. If the bucket still exceeds `compactThreshold` afterwards, the
/// oldest records are trimmed from the front.
pub fn compact(
    status: &mut PodProtectorStatus,
    cell_id: &str,
    config: &AdmissionHistoryConfig,
) -> CompactStats {
    let last_event = status
        .cell(cell_id)
        .and_then(|cell| cell.aggregation.last_event_time.clone());

    let mut stats = CompactStats::default();
    if let Some(bucket) = status
        .admission_history
        .buckets
        .iter_mut()
        .find(|b| b.cell_id == cell_id)
    {
        if let Some(last_event) = last_event {
            let before = bucket.records.len();
            bucket
                .records
                .retain(|record| record.deletion_timestamp.0 > last_event.0);
            stats.aged_out = before - bucket.records.len();
        }

        let threshold = config.compact_threshold();
        if bucket.records.len() > threshold {
            stats.forced = bucket.records.len() - threshold;
            bucket.records.drain(..stats.forced);
        }
    }
    status.prune_empty_buckets();
    stats
}

/// The webhook's decision for one pod-deletion request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    RejectUnavailable {
        available: u32,
        pending: usize,
        min_available: u32,
    },
    RejectBufferFull {
        pending: usize,
        max_concurrent_lag: usize,
    },
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Admit => write!(f, "admitted"),
            Verdict::RejectUnavailable {
                available,
                pending,
                min_available,
            } => write!(
                f,
                "reports too few available replicas to admit pod deletion \
                 ({available} available, {pending} pending deletions, {min_available} required)",
            ),
            Verdict::RejectBufferFull {
                pending,
                max_concurrent_lag,
            } => write!(
                f,
                "has full admission buffer and is temporarily unable to admit pod deletion \
                 ({pending} of {max_concurrent_lag} pending deletions)",
            ),
        }
    }
}

/// Decides one deletion against the last published status, appending an
/// admission record on success.
///
/// The precondition is evaluated against the summary *minus* every record
/// still pending in any bucket: an admitted deletion keeps consuming quota
/// until some aggregator observes it gone. A pod that was never counted
/// available consumes no quota and is always admitted without a record.
pub fn try_admit(
    status: &mut PodProtectorStatus,
    min_available: u32,
    config: &AdmissionHistoryConfig,
    cell_id: &str,
    pod_uid: &str,
    pod_available: bool,
    now: MicroTime,
) -> Verdict {
    if !pod_available {
        return Verdict::Admit;
    }

    let pending = status.admission_history.total_records();
    if let Some(max_concurrent_lag) = config.max_concurrent_lag() {
        if pending >= max_concurrent_lag {
            return Verdict::RejectBufferFull {
                pending,
                max_concurrent_lag,
            };
        }
    }

    let available = status.summary.available_replicas;
    if i64::from(available) - pending as i64 - 1 < i64::from(min_available) {
        return Verdict::RejectUnavailable {
            available,
            pending,
            min_available,
        };
    }

    let bucket = status.bucket_mut(cell_id);
    // Bucket timestamps are non-decreasing; clamp against webhook clock skew.
    let deletion_timestamp = match bucket.records.last() {
        Some(last) if last.deletion_timestamp.0 > now.0 => last.deletion_timestamp.clone(),
        _ => now,
    };
    bucket.records.push(AdmissionRecord {
        uid: pod_uid.to_string(),
        deletion_timestamp,
    });
    Verdict::Admit
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn micro(secs: i64) -> MicroTime {
        MicroTime(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn aggregation(available: u32, last_event: i64) -> PodProtectorAggregation {
        PodProtectorAggregation {
            total_replicas: available,
            scheduled_replicas: available,
            running_replicas: available,
            ready_replicas: available,
            available_replicas: available,
            last_event_time: Some(micro(last_event)),
        }
    }

    fn two_cell_status() -> PodProtectorStatus {
        let mut status = PodProtectorStatus::default();
        status.set_cell("worker-1", aggregation(3, 100));
        status.set_cell("worker-2", aggregation(4, 100));
        summarize(&mut status);
        status
    }

    #[test]
    fn summary_is_the_pointwise_sum_of_cells() {
        let status = two_cell_status();
        assert_eq!(status.summary.total_replicas, 7);
        assert_eq!(status.summary.available_replicas, 7);
        assert_eq!(status.summary.last_event_time, Some(micro(100)));
    }

    #[test]
    fn compact_drops_records_observed_by_aggregation() {
        let mut status = two_cell_status();
        status.bucket_mut("worker-1").records.push(AdmissionRecord {
            uid: "uid-a".into(),
            deletion_timestamp: micro(50),
        });

        let stats = compact(&mut status, "worker-1", &AdmissionHistoryConfig::default());
        assert_eq!(stats, CompactStats { aged_out: 1, forced: 0 });
        assert!(status.bucket("worker-1").is_none());

        // A record newer than the cell's lastEventTime survives.
        status.bucket_mut("worker-1").records.push(AdmissionRecord {
            uid: "uid-b".into(),
            deletion_timestamp: micro(150),
        });
        let stats = compact(&mut status, "worker-1", &AdmissionHistoryConfig::default());
        assert_eq!(stats, CompactStats::default());
        assert_eq!(status.bucket("worker-1").unwrap().records.len(), 1);
    }

    #[test]
    fn compact_never_touches_foreign_buckets() {
        let mut status = two_cell_status();
        status.bucket_mut("worker-2").records.push(AdmissionRecord {
            uid: "uid-a".into(),
            deletion_timestamp: micro(50),
        });

        compact(&mut status, "worker-1", &AdmissionHistoryConfig::default());
        assert_eq!(status.bucket("worker-2").unwrap().records.len(), 1);
    }

    #[test]
    fn threshold_overflow_is_front_trimmed() {
        let mut status = two_cell_status();
        for i in 0..5 {
            status.bucket_mut("worker-1").records.push(AdmissionRecord {
                uid: format!("uid-{i}"),
                deletion_timestamp: micro(200 + i),
            });
        }

        let config = AdmissionHistoryConfig {
            compact_threshold: Some(3),
            ..Default::default()
        };
        let stats = compact(&mut status, "worker-1", &config);
        assert_eq!(stats, CompactStats { aged_out: 0, forced: 2 });

        let records = &status.bucket("worker-1").unwrap().records;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].uid, "uid-2");
    }

    #[test]
    fn zero_threshold_empties_the_bucket_every_compaction() {
        let mut status = two_cell_status();
        status.bucket_mut("worker-1").records.push(AdmissionRecord {
            uid: "uid-a".into(),
            deletion_timestamp: micro(500),
        });

        let config = AdmissionHistoryConfig {
            compact_threshold: Some(0),
            ..Default::default()
        };
        compact(&mut status, "worker-1", &config);
        assert!(status.bucket("worker-1").is_none());
    }

    #[test]
    fn admissions_stop_before_breaking_min_available() {
        // Seven available pods, five must stay: two deletions are admitted,
        // the third is rejected even though aggregation has not caught up.
        let mut status = two_cell_status();
        let config = AdmissionHistoryConfig::default();

        for uid in ["uid-a", "uid-b"] {
            let verdict = try_admit(&mut status, 5, &config, "worker-1", uid, true, micro(200));
            assert_eq!(verdict, Verdict::Admit);
        }
        let verdict = try_admit(&mut status, 5, &config, "worker-1", "uid-c", true, micro(201));
        assert_eq!(
            verdict,
            Verdict::RejectUnavailable {
                available: 7,
                pending: 2,
                min_available: 5,
            },
        );
        assert_eq!(status.admission_history.total_records(), 2);
    }

    #[test]
    fn pending_records_in_other_buckets_consume_quota_too() {
        let mut status = two_cell_status();
        let config = AdmissionHistoryConfig::default();

        assert!(try_admit(&mut status, 5, &config, "worker-1", "uid-a", true, micro(200)).is_admit());
        assert!(try_admit(&mut status, 5, &config, "worker-2", "uid-b", true, micro(200)).is_admit());
        assert!(!try_admit(&mut status, 5, &config, "worker-1", "uid-c", true, micro(201)).is_admit());
    }

    #[test]
    fn full_admission_buffer_rejects_despite_available_quota() {
        let mut status = PodProtectorStatus::default();
        status.set_cell("worker-1", aggregation(5, 100));
        summarize(&mut status);

        let config = AdmissionHistoryConfig {
            max_concurrent_lag: Some(1),
            ..Default::default()
        };
        assert!(try_admit(&mut status, 1, &config, "worker-1", "uid-a", true, micro(200)).is_admit());
        assert_eq!(
            try_admit(&mut status, 1, &config, "worker-1", "uid-b", true, micro(201)),
            Verdict::RejectBufferFull {
                pending: 1,
                max_concurrent_lag: 1,
            },
        );
    }

    #[test]
    fn unavailable_pod_deletion_is_always_admitted() {
        let mut status = PodProtectorStatus::default();
        status.set_cell("worker-1", aggregation(0, 100));
        summarize(&mut status);

        let verdict = try_admit(
            &mut status,
            2,
            &AdmissionHistoryConfig::default(),
            "worker-1",
            "uid-a",
            false,
            micro(200),
        );
        assert_eq!(verdict, Verdict::Admit);
        assert_eq!(status.admission_history.total_records(), 0);
    }

    #[test]
    fn bucket_timestamps_stay_monotonic_under_clock_skew() {
        let mut status = two_cell_status();
        let config = AdmissionHistoryConfig::default();

        assert!(try_admit(&mut status, 1, &config, "worker-1", "uid-a", true, micro(300)).is_admit());
        // A webhook replica with a lagging clock admits next.
        assert!(try_admit(&mut status, 1, &config, "worker-1", "uid-b", true, micro(250)).is_admit());

        let records = &status.bucket("worker-1").unwrap().records;
        assert_eq!(records[0].deletion_timestamp, micro(300));
        assert_eq!(records[1].deletion_timestamp, micro(300));
    }

    #[test]
    fn rejection_messages_name_the_reason() {
        let unavailable = Verdict::RejectUnavailable {
            available: 5,
            pending: 1,
            min_available: 5,
        };
        assert!(unavailable
            .to_string()
            .contains("reports too few available replicas to admit pod deletion"));

        let full = Verdict::RejectBufferFull {
            pending: 1,
            max_concurrent_lag: 1,
        };
        assert!(full
            .to_string()
            .contains("has full admission buffer and is temporarily unable to admit pod deletion"));
    }

}
