use tokio_util::sync::CancellationToken;
use vsfleet_providers::inventory::{CloneSpec, ObjectRef, TaskRequest};
use vsfleet_providers::HypervisorGateway;

use crate::config::{Deployment, Placement};
use crate::error::{GroupError, TaskPhase};
use crate::remote::{race, submit_and_wait};

/// Source template and destination folder, resolved once per scale-out batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneTarget {
    pub source: ObjectRef,
    /// Display name of the template, used to pick the library item.
    pub source_name: String,
    pub folder: ObjectRef,
    /// Datacenter every placement lookup is scoped to.
    pub datacenter: String,
}

/// Materialize one new VM named `name` with the configured strategy.
///
/// Returns once the backend task finished. Waiting for a guest address is a
/// separate concern (see `InstanceGroup::wait_for_connect_info`).
pub async fn provision(
    gateway: &dyn HypervisorGateway,
    deployment: &Deployment,
    target: &CloneTarget,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), GroupError> {
    let request = match deployment {
        // Instant clones inherit resources and placement from the running source.
        Deployment::InstantClone => TaskRequest::InstantClone {
            source: target.source.clone(),
            name: name.to_string(),
            folder: target.folder.clone(),
        },
        Deployment::FullClone(placement) => TaskRequest::Clone {
            source: target.source.clone(),
            name: name.to_string(),
            spec: clone_spec(gateway, placement, target, cancel).await?,
        },
        Deployment::LibraryDeploy { library, placement } => {
            let item = race(cancel, gateway.find_library_item(library, &target.source_name))
                .await?
                .map_err(|e| GroupError::lookup(format!("{}/{}", library, target.source_name), e))?;
            TaskRequest::LibraryDeploy {
                item,
                name: name.to_string(),
                spec: clone_spec(gateway, placement, target, cancel).await?,
            }
        }
    };

    tracing::debug!(
        "🔵 [provisioner] Submitting {} for {}",
        request.operation(),
        name
    );
    submit_and_wait(
        gateway,
        request,
        name,
        (TaskPhase::Submit, TaskPhase::Complete),
        cancel,
    )
    .await?;
    tracing::info!(
        "✅ [provisioner] Created {} ({})",
        name,
        deployment.deploy_type()
    );
    Ok(())
}

/// Resolve host, pool and datastore inside the configured datacenter and cluster.
async fn clone_spec(
    gateway: &dyn HypervisorGateway,
    placement: &Placement,
    target: &CloneTarget,
    cancel: &CancellationToken,
) -> Result<CloneSpec, GroupError> {
    let datacenter = target.datacenter.as_str();
    let cluster = placement.cluster.as_str();
    let host = race(cancel, gateway.find_host(datacenter, cluster, &placement.host))
        .await?
        .map_err(|e| GroupError::lookup(placement.host.as_str(), e))?;
    let resource_pool = race(
        cancel,
        gateway.find_resource_pool(datacenter, cluster, &placement.resource_pool),
    )
    .await?
    .map_err(|e| GroupError::lookup(placement.resource_pool.as_str(), e))?;
    let datastore = race(cancel, gateway.find_datastore(datacenter, &placement.datastore))
        .await?
        .map_err(|e| GroupError::lookup(placement.datastore.as_str(), e))?;

    Ok(CloneSpec {
        folder: target.folder.clone(),
        host,
        resource_pool,
        datastore,
        sizing: placement.sizing,
        power_on: true,
    })
}
