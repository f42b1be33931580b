#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod protector;

pub use self::labels::Labels;
pub use self::protector::{
    AdmissionBucket, AdmissionHistory, AdmissionHistoryConfig, AdmissionRecord, PodProtector,
    PodProtectorAggregation, PodProtectorCellStatus, PodProtectorSpec, PodProtectorStatus,
};
pub use k8s_openapi::{
    api::core::v1::{Pod, PodCondition, PodSpec, PodStatus},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error,
};
