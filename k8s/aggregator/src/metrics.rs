use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use std::{sync::atomic::AtomicU64, time::Duration};

use podseidon_aggregator_core::{DrainStats, Observe};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    queue: String,
    result: String,
}

/// Aggregator metric surface, registered once and shared by the queue
/// observer, the drain task, and the reconcile engine.
pub struct AggregatorMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
    reconcile_duration: Family<ReconcileLabels, Histogram>,

    pool_size: Gauge,
    pool_oldest_seconds: Gauge<f64, AtomicU64>,
    drain_size: Histogram,
    drain_period: Histogram,
    drain_oldest: Histogram,

    forced_compactions: Counter,
}

impl AggregatorMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::<ReconcileLabels, Counter>::default();
        prom.register(
            "reconciles",
            "Count of reconcile attempts by outcome",
            reconciles.clone(),
        );

        let reconcile_duration = Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 14))
        });
        prom.register_with_unit(
            "reconcile_duration",
            "Duration of reconcile attempts by outcome",
            Unit::Seconds,
            reconcile_duration.clone(),
        );

        let pool_size = Gauge::default();
        prom.register(
            "pending_pool_size",
            "Number of protector keys currently parked in the pending-event pool",
            pool_size.clone(),
        );

        let pool_oldest_seconds = Gauge::<f64, AtomicU64>::default();
        prom.register_with_unit(
            "pending_pool_oldest",
            "Age of the oldest entry in the pending-event pool",
            Unit::Seconds,
            pool_oldest_seconds.clone(),
        );

        let drain_size = Histogram::new(exponential_buckets(1.0, 2.0, 16));
        prom.register(
            "pending_pool_drain_size",
            "Number of protector keys removed by each pool drain",
            drain_size.clone(),
        );

        let drain_period = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        prom.register_with_unit(
            "pending_pool_drain_period",
            "Time between successive pool drains",
            Unit::Seconds,
            drain_period.clone(),
        );

        let drain_oldest = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        prom.register_with_unit(
            "pending_pool_drain_oldest",
            "Age of the oldest pool entry at each drain",
            Unit::Seconds,
            drain_oldest.clone(),
        );

        let forced_compactions = Counter::default();
        prom.register(
            "forced_compactions",
            "Count of admission records dropped by the compact-threshold safety valve",
            forced_compactions.clone(),
        );

        Self {
            reconciles,
            reconcile_duration,
            pool_size,
            pool_oldest_seconds,
            drain_size,
            drain_period,
            drain_oldest,
            forced_compactions,
        }
    }

    /// Samples the pool gauges; called from every drain-timer tick.
    pub fn sample_pool(&self, size: usize, oldest: Option<Duration>) {
        self.pool_size.set(size as i64);
        self.pool_oldest_seconds
            .set(oldest.unwrap_or_default().as_secs_f64());
    }

    pub fn observe_drain(&self, stats: &DrainStats) {
        self.drain_size.observe(stats.size as f64);
        if let Some(oldest) = stats.oldest {
            self.drain_oldest.observe(oldest.as_secs_f64());
        }
        if let Some(period) = stats.since_last_drain {
            self.drain_period.observe(period.as_secs_f64());
        }
    }

    pub fn observe_forced_compactions(&self, records: usize) {
        self.forced_compactions.inc_by(records as u64);
    }
}

impl Observe for AggregatorMetrics {
    fn reconciled(&self, queue: &'static str, outcome: &'static str, elapsed: Duration) {
        let labels = ReconcileLabels {
            queue: queue.to_string(),
            result: outcome.to_string(),
        };
        self.reconciles.get_or_create(&labels).inc();
        self.reconcile_duration
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }
}
