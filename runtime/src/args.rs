use crate::{
    aggregator::{Aggregator, AggregatorMetrics},
    core::{Queue, QueueParams},
    index::{
        pod::PodIndex, protector::ProtectorIndex, source::CoreSource, PodPool, ResourceId,
        SharedPodIndex, SharedProtectorIndex,
    },
    k8s, lease,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{watcher, WatchStreamExt};
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::watch, time};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "aggregator",
    about = "Aggregates per-cluster pod availability into PodProtector statuses"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "podseidon=info,warn",
        env = "PODSEIDON_AGGREGATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Identifier of this worker cluster's cell in PodProtector statuses.
    #[clap(long, default_value = "default")]
    cell: String,

    /// Kubeconfig for the central cluster holding the PodProtector objects.
    /// The worker cluster's own client is used when unset.
    #[clap(long)]
    core_kubeconfig: Option<PathBuf>,

    /// Context to select from the central cluster's kubeconfig.
    #[clap(long)]
    core_kube_context: Option<String>,

    /// Namespace to watch for PodProtectors on the central cluster; all
    /// namespaces when unset.
    #[clap(long)]
    core_target_namespace: Option<String>,

    #[clap(long, default_value = "4")]
    reconcile_workers: usize,

    /// Cadence of the pending-pool drain timer.
    #[clap(long, default_value = "1000")]
    aggregation_interval_ms: u64,

    #[clap(long, default_value = "100")]
    retry_initial_backoff_ms: u64,

    /// Ceiling of the per-protector retry backoff.
    #[clap(long, default_value = "30000")]
    retry_max_backoff_ms: u64,

    /// Deployment owning the leader-election Lease.
    #[clap(long, default_value = "podseidon-aggregator")]
    deployment_name: String,

    #[clap(long, default_value = "podseidon")]
    control_plane_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            cell,
            core_kubeconfig,
            core_kube_context,
            core_target_namespace,
            reconcile_workers,
            aggregation_interval_ms,
            retry_initial_backoff_ms,
            retry_max_backoff_ms,
            deployment_name,
            control_plane_namespace,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = Arc::new(AggregatorMetrics::register(
            prom.sub_registry_with_prefix("aggregator"),
        ));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // The central cluster replicates PodProtectors to us and receives our
        // status writes; single-cluster deployments reuse the worker client.
        let central_client = match core_kubeconfig {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(&path)?;
                let options = kube::config::KubeConfigOptions {
                    context: core_kube_context.clone(),
                    ..Default::default()
                };
                let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
                kube::Client::try_from(config)?
            }
            None => runtime.client(),
        };

        let queue = Queue::new(
            "aggregator",
            QueueParams {
                initial_backoff: Duration::from_millis(retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(retry_max_backoff_ms),
            },
            metrics.clone(),
        );

        let protectors: SharedProtectorIndex = Arc::new(RwLock::new(ProtectorIndex::new(
            cell.clone(),
            queue.clone(),
        )));
        let pool = Arc::new(PodPool::default());
        let pods: SharedPodIndex = Arc::new(RwLock::new(PodIndex::new(
            protectors.clone(),
            pool.clone(),
        )));

        // Spawn the pod watch on this worker cluster.
        let pod_events = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(pods.clone(), pod_events).instrument(info_span!("pods")));

        // Spawn the PodProtector watch on the central cluster.
        let protector_api = match core_target_namespace.as_deref() {
            Some(namespace) => {
                k8s::Api::<k8s::PodProtector>::namespaced(central_client.clone(), namespace)
            }
            None => k8s::Api::<k8s::PodProtector>::all(central_client.clone()),
        };
        let protector_events = watcher(protector_api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| futures::future::ready(event.ok()));
        tokio::spawn(
            kubert::index::namespaced(protectors.clone(), protector_events)
                .instrument(info_span!("podprotectors")),
        );

        let hostname =
            std::env::var("HOSTNAME").expect("Failed to fetch `HOSTNAME` environment variable");
        let claims = lease::init(
            &runtime,
            &control_plane_namespace,
            &deployment_name,
            &hostname,
            &cell,
        )
        .await?;

        let source = Arc::new(CoreSource::new(pods.clone()));
        let aggregator = Arc::new(Aggregator::new(
            central_client,
            cell.clone(),
            protectors.clone(),
            source,
            metrics.clone(),
        ));

        // Reconcile workers: only the lease holder writes; non-leaders drop
        // their keys and pick everything up again on claim transition.
        {
            let queue = queue.clone();
            let claims = claims.clone();
            let hostname = hostname.clone();
            let shutdown = runtime.shutdown_handle();
            let reconcile = move |key: ResourceId| {
                let aggregator = aggregator.clone();
                let claims = claims.clone();
                let hostname = hostname.clone();
                async move {
                    if !claims.borrow().is_current_for(&hostname) {
                        return Ok(());
                    }
                    aggregator.reconcile(key).await
                }
            };
            tokio::spawn(
                async move { queue.run(reconcile_workers, reconcile, shutdown).await }
                    .instrument(info_span!("reconcile")),
            );
        }

        // Drain timer: batches pooled pod events into reconciles and samples
        // the pool gauges.
        {
            let pool = pool.clone();
            let queue = queue.clone();
            let metrics = metrics.clone();
            let claims = claims.clone();
            let hostname = hostname.clone();
            let shutdown = runtime.shutdown_handle();
            tokio::spawn(
                drain_pool(
                    pool,
                    queue,
                    metrics,
                    claims,
                    hostname,
                    Duration::from_millis(aggregation_interval_ms),
                    shutdown,
                )
                .instrument(info_span!("drain")),
            );
        }

        // Re-reconcile everything when this replica claims the lease: writes
        // abandoned by the previous leader are repaired by the fresh pass.
        {
            let queue = queue.clone();
            let protectors = protectors.clone();
            let mut claims = claims.clone();
            let hostname = hostname.clone();
            tokio::spawn(
                async move {
                    let mut was_leader = claims.borrow().is_current_for(&hostname);
                    while claims.changed().await.is_ok() {
                        let is_leader = claims.borrow_and_update().is_current_for(&hostname);
                        if is_leader && !was_leader {
                            info!("Claimed the write lease; reconciling all PodProtectors");
                            for key in protectors.read().keys() {
                                queue.enqueue(key);
                            }
                        }
                        was_leader = is_leader;
                    }
                }
                .instrument(info_span!("lease")),
            );
        }

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn drain_pool(
    pool: Arc<PodPool>,
    queue: Queue<ResourceId>,
    metrics: Arc<AggregatorMetrics>,
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
    period: Duration,
    shutdown: drain::Watch,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let signaled = shutdown.signaled();
    tokio::pin!(signaled);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                metrics.sample_pool(pool.len(), pool.oldest_latency(now));
                if !claims.borrow().is_current_for(&hostname) {
                    continue;
                }
                let (entries, stats) = pool.drain(now);
                metrics.observe_drain(&stats);
                for (key, _pods) in entries {
                    queue.enqueue(key);
                }
            }
            _ = &mut signaled => return,
        }
    }
}
