//! Worker-cluster indexing state for the aggregator.
//!
//! Three structures cooperate here:
//!
//! - [`selectors::Selectors`] resolves a pod's labels to the protectors whose
//!   selector matches, through an inverted index over equality requirements.
//! - [`pod::PodIndex`] consumes the pod watch, keeps a per-namespace pod
//!   store, and routes every relevant pod event into the pending-event pool
//!   under each matching protector key.
//! - [`protector::ProtectorIndex`] consumes the `PodProtector` watch from the
//!   central cluster, keeps protector snapshots for the reconcile loop, and
//!   enqueues a reconcile whenever an object changes under it.
//!
//! The pod event handler runs on the informer task and must stay short: one
//! selector query plus one pool insert, no I/O.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod pod;
pub mod protector;
pub mod selectors;
pub mod source;

use parking_lot::RwLock;
use std::sync::Arc;

use podseidon_aggregator_core::PendingPool;

/// Namespace/name pair identifying a namespaced resource.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: String, name: String) -> Self {
        Self { namespace, name }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub type SharedPodIndex = Arc<RwLock<pod::PodIndex>>;
pub type SharedProtectorIndex = Arc<RwLock<protector::ProtectorIndex>>;

/// Pending-event pool mapping protector keys to the pod keys whose events
/// triggered them.
pub type PodPool = PendingPool<ResourceId, ResourceId>;
