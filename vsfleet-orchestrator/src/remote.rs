use std::future::Future;
use tokio_util::sync::CancellationToken;
use vsfleet_providers::inventory::TaskRequest;
use vsfleet_providers::HypervisorGateway;

use crate::error::{GroupError, TaskPhase};

/// Race a blocking remote call against the operation's cancellation token.
pub async fn race<F>(cancel: &CancellationToken, fut: F) -> Result<F::Output, GroupError>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GroupError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Submit one long-running operation and await its completion.
///
/// Submission and completion failures are tagged with their own phase so the
/// caller can tell a rejected request from a task that failed midway.
pub async fn submit_and_wait(
    gateway: &dyn HypervisorGateway,
    request: TaskRequest,
    target: &str,
    phases: (TaskPhase, TaskPhase),
    cancel: &CancellationToken,
) -> Result<(), GroupError> {
    let (submit_phase, complete_phase) = phases;
    let handle = race(cancel, gateway.submit_task(request))
        .await?
        .map_err(|e| GroupError::task(submit_phase, target, e))?;
    race(cancel, gateway.wait_task(&handle))
        .await?
        .map_err(|e| GroupError::task(complete_phase, target, e))
}
