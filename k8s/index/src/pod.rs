use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use kubert::index::NamespacedRemoved;
use std::{sync::Arc, time::Instant};

use podseidon_k8s_api::{labels::Labels, Pod, ResourceExt};

use crate::{PodPool, ResourceId, SharedProtectorIndex};

/// The slice of a pod's state the aggregation cares about.
#[derive(Clone, Debug, PartialEq)]
pub struct PodMeta {
    pub uid: String,
    pub labels: Labels,
    pub scheduled: bool,
    pub running: bool,
    pub ready: bool,

    /// When the pod last transitioned into readiness. Only set while the pod
    /// is ready.
    pub ready_since: Option<DateTime<Utc>>,
}

/// Per-namespace store of pod state, fed by the worker cluster's pod watch.
///
/// Every observed change routes the pod to its matching protectors through
/// the selector index and parks the pair in the pending-event pool; the drain
/// timer turns pooled keys into reconciles.
pub struct PodIndex {
    namespaces: HashMap<String, HashMap<String, PodMeta>>,
    protectors: SharedProtectorIndex,
    pool: Arc<PodPool>,

    /// Wall-clock time of the most recent watch event folded into the store.
    last_event: Option<DateTime<Utc>>,

    /// Set once the initial list has been applied. Until then the store must
    /// not be trusted: an empty namespace may simply not have been listed yet.
    synced: bool,
}

impl PodIndex {
    pub fn new(protectors: SharedProtectorIndex, pool: Arc<PodPool>) -> Self {
        Self {
            namespaces: HashMap::new(),
            protectors,
            pool,
            last_event: None,
            synced: false,
        }
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Lower bound on the freshness of this store: the time of the newest
    /// event folded in.
    pub fn sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_event
    }

    pub fn pods_in(&self, namespace: &str) -> impl Iterator<Item = &PodMeta> {
        self.namespaces.get(namespace).into_iter().flatten()
            .map(|(_, meta)| meta)
    }

    fn observe(&mut self, now: DateTime<Utc>) {
        if self.last_event.is_none_or(|last| last < now) {
            self.last_event = Some(now);
        }
    }

    fn route(&self, namespace: &str, pod: &ResourceId, labels: &Labels, now: Instant) {
        let protectors = self.protectors.read();
        for key in protectors.matching(namespace, labels) {
            self.pool.add(key, pod.clone(), now);
        }
    }

    fn apply_meta(&mut self, namespace: String, name: String, meta: PodMeta) {
        self.observe(Utc::now());

        let pod = ResourceId::new(namespace.clone(), name.clone());
        let prev = self
            .namespaces
            .entry(namespace.clone())
            .or_default()
            .insert(name, meta.clone());
        if prev.as_ref() == Some(&meta) {
            return;
        }

        let now = Instant::now();
        self.route(&namespace, &pod, &meta.labels, now);
        // A relabeled pod stops counting for its old protectors; they must
        // re-aggregate too.
        if let Some(prev) = prev {
            if prev.labels != meta.labels {
                self.route(&namespace, &pod, &prev.labels, now);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for PodIndex {
    fn apply(&mut self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_unchecked();
        let meta = pod_meta(&pod);
        self.apply_meta(namespace, name, meta);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.observe(Utc::now());

        let Some(pods) = self.namespaces.get_mut(&namespace) else {
            return;
        };
        let Some(prev) = pods.remove(&name) else {
            return;
        };
        if pods.is_empty() {
            self.namespaces.remove(&namespace);
        }

        let pod = ResourceId::new(namespace.clone(), name);
        self.route(&namespace, &pod, &prev.labels, Instant::now());
    }

    fn reset(&mut self, pods: Vec<Pod>, removed: NamespacedRemoved) {
        for pod in pods {
            self.apply(pod);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete(namespace.clone(), name);
            }
        }
        self.synced = true;
        self.observe(Utc::now());
    }
}

fn pod_meta(pod: &Pod) -> PodMeta {
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|node| !node.is_empty());
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");

    let ready_condition = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));
    let ready = ready_condition.is_some_and(|c| c.status == "True");
    let ready_since = if ready {
        ready_condition
            .and_then(|c| c.last_transition_time.as_ref())
            .map(|t| t.0)
    } else {
        None
    };

    PodMeta {
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        labels: pod.metadata.labels.clone().into(),
        scheduled,
        running,
        ready,
        ready_since,
    }
}
