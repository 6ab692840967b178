use tokio_util::sync::CancellationToken;
use vsfleet_providers::inventory::{ObjectRef, PowerState, TaskRequest};
use vsfleet_providers::{GatewayError, HypervisorGateway};

use crate::error::{GroupError, TaskPhase};
use crate::naming;
use crate::remote::{race, submit_and_wait};

/// Power off (when needed) and destroy one group member.
///
/// The VM is resolved by name inside the group folder; an unknown name is a
/// lookup error, so a second teardown of the same name fails cleanly.
pub async fn teardown(
    gateway: &dyn HypervisorGateway,
    folder: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), GroupError> {
    let path = naming::instance_path(folder, name);
    let vm = race(cancel, gateway.find_vm(&path))
        .await?
        .map_err(|e| GroupError::lookup(path.as_str(), e))?;

    power_off(gateway, &vm, name, cancel).await?;

    submit_and_wait(
        gateway,
        TaskRequest::Destroy { vm },
        name,
        (TaskPhase::Destroy, TaskPhase::Destroy),
        cancel,
    )
    .await?;
    tracing::info!("🗑️ [teardown] Destroyed {}", name);
    Ok(())
}

async fn power_off(
    gateway: &dyn HypervisorGateway,
    vm: &ObjectRef,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), GroupError> {
    let state = race(cancel, gateway.power_state(vm))
        .await?
        .map_err(|e| GroupError::task(TaskPhase::PowerOff, name, e))?;
    if state == PowerState::PoweredOff {
        tracing::debug!("[teardown] {} already powered off", name);
        return Ok(());
    }

    let result = submit_and_wait(
        gateway,
        TaskRequest::PowerOff { vm: vm.clone() },
        name,
        (TaskPhase::PowerOff, TaskPhase::PowerOff),
        cancel,
    )
    .await;
    match result {
        // Lost a race with something else stopping the VM.
        Err(GroupError::Task {
            source: GatewayError::AlreadyInState(_),
            ..
        }) => {
            tracing::debug!("[teardown] {} stopped concurrently", name);
            Ok(())
        }
        other => other,
    }
}
