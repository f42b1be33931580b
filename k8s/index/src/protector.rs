use ahash::AHashMap as HashMap;
use std::sync::Arc;

use podseidon_aggregator_core::Queue;
use podseidon_k8s_api::{labels::Labels, PodProtector, ResourceExt};

use crate::{selectors::Selectors, ResourceId};

/// Central-cluster `PodProtector` snapshots plus the selector index that
/// routes pod events to them.
///
/// Applying a changed object also acts as the update trigger: whenever the
/// spec or the status moves under us (a webhook appended an admission record,
/// another cell republished its aggregation), the key is enqueued for a
/// prompt reconcile. Per-key coalescing is the queue's problem, not ours.
pub struct ProtectorIndex {
    cell: String,
    protectors: HashMap<ResourceId, Arc<PodProtector>>,
    selectors: Selectors<ResourceId>,
    queue: Queue<ResourceId>,

    /// Generations whose invalid selector has already been reported, so the
    /// error is logged once per generation rather than once per event.
    invalid: HashMap<ResourceId, i64>,
}

impl ProtectorIndex {
    pub fn new(cell: String, queue: Queue<ResourceId>) -> Self {
        Self {
            cell,
            protectors: HashMap::new(),
            selectors: Selectors::default(),
            queue,
            invalid: HashMap::new(),
        }
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    /// Latest observed snapshot for a protector, if it still exists.
    pub fn get(&self, id: &ResourceId) -> Option<Arc<PodProtector>> {
        self.protectors.get(id).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceId> {
        self.protectors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.protectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protectors.is_empty()
    }

    /// Protectors in `namespace` whose selector matches the given pod labels.
    pub fn matching(&self, namespace: &str, labels: &Labels) -> Vec<ResourceId> {
        self.selectors
            .query(labels)
            .filter(|id| id.namespace == namespace)
            .cloned()
            .collect()
    }
}

impl kubert::index::IndexNamespacedResource<PodProtector> for ProtectorIndex {
    fn apply(&mut self, protector: PodProtector) {
        let id = ResourceId::new(
            protector.namespace().unwrap_or_default(),
            protector.name_unchecked(),
        );
        let generation = protector.metadata.generation.unwrap_or(0);

        match self.selectors.track(id.clone(), protector.spec.selector.clone()) {
            Ok(()) => {
                self.invalid.remove(&id);
            }
            Err(error) => {
                if self.invalid.insert(id.clone(), generation) != Some(generation) {
                    tracing::error!(
                        namespace = %id.namespace,
                        name = %id.name,
                        %generation,
                        %error,
                        "Not indexing PodProtector with invalid selector",
                    );
                }
            }
        }

        let protector = Arc::new(protector);
        let prev = self.protectors.insert(id.clone(), protector.clone());
        let changed = match prev {
            None => true,
            Some(prev) => prev.spec != protector.spec || prev.status != protector.status,
        };
        if changed {
            self.queue.enqueue(id);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.selectors.untrack(&id);
        self.invalid.remove(&id);
        self.protectors.remove(&id);
    }
}
