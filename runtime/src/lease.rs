use crate::k8s::{self, ObjectMeta, Resource};
use anyhow::Result;
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use kube::api::PatchParams;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "podseidon-aggregator";

/// Creates (if needed) and claims the per-cell write lease on the worker
/// cluster. Only the claim holder drains the pool, reconciles, and writes
/// statuses; everyone else just keeps its indexes warm.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    namespace: &str,
    deployment_name: &str,
    claimant: &str,
    cell: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let lease_name = format!("podseidon-aggregator-write-{cell}");
    let params = kubert::LeaseParams {
        name: lease_name.clone(),
        namespace: namespace.to_string(),
        claimant: claimant.to_string(),
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
        field_manager: Some(FIELD_MANAGER.into()),
    };

    // Fetch the aggregator deployment so that we can use it as an owner
    // reference of the Lease.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), namespace);
    let mut tries = 3;
    let deployment = loop {
        tries -= 1;
        let error = match api.get(deployment_name).await {
            Ok(deployment) => {
                tracing::debug!(?deployment, "Found Deployment");
                break deployment;
            }
            Err(error) => error,
        };
        if tries == 0 {
            anyhow::bail!(error);
        }
        tracing::warn!(?error, "Failed to fetch deployment, retrying in 1s...");
        time::sleep(time::Duration::from_secs(1)).await;
    };

    let patch = kube::api::Patch::Apply(coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: deployment
                .controller_owner_ref(&())
                .map(|owner| vec![owner]),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/part-of".to_string(),
                        "podseidon".to_string(),
                    ),
                    ("podseidon.kubewharf.io/cell".to_string(), cell.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    });
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), namespace);

    // An individual request may timeout or hit a transient error, so we try
    // up to 3 times with a brief pause.
    let mut tries = 3;
    loop {
        tries -= 1;
        let error = match api.patch(&lease_name, &patch_params, &patch).await {
            Ok(lease) => {
                tracing::info!(?lease, "Created Lease");
                break;
            }
            Err(k8s::Error::Api(error)) if error.code < 500 => {
                tracing::debug!(?error, "Lease already exists");
                break;
            }
            Err(error) => error,
        };
        if tries == 0 {
            anyhow::bail!(error);
        }
        tracing::warn!(?error, "Failed to create Lease, retrying in 1s...");
        time::sleep(time::Duration::from_secs(1)).await;
    }

    let (claim, _task) = runtime.spawn_lease(params).await?;
    Ok(claim)
}
