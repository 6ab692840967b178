use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vsfleet_common::ConnectInfo;

use crate::error::GroupError;
use crate::group::InstanceGroup;
use crate::remote::race;

/// Exponential backoff used while waiting for a guest to report an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
    /// Total budget across all attempts.
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2,
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl ReadinessPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delays between attempts, capped at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |d| {
            Some(d.saturating_mul(self.factor).min(self.max_delay))
        })
    }
}

impl InstanceGroup {
    /// Poll [`InstanceGroup::connect_info`] until the guest reports an IPv4 address.
    ///
    /// Only [`GroupError::NoAddress`] is retried; any other error is returned
    /// immediately.
    pub async fn wait_for_connect_info(
        &self,
        name: &str,
        policy: &ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> Result<ConnectInfo, GroupError> {
        let started = Instant::now();
        let mut delays = policy.delays();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.connect_info(name, cancel).await {
                Err(GroupError::NoAddress(_)) => {}
                other => {
                    if other.is_ok() && attempts > 1 {
                        tracing::info!("✅ [readiness] {} ready after {} attempts", name, attempts);
                    }
                    return other;
                }
            }

            let waited = started.elapsed();
            if waited >= policy.timeout {
                tracing::warn!("⏱️ [readiness] {} has no address after {:?}", name, waited);
                return Err(GroupError::ReadinessTimeout {
                    name: name.to_string(),
                    waited,
                });
            }
            let delay = delays
                .next()
                .unwrap_or(policy.max_delay)
                .min(policy.timeout - waited);
            tracing::debug!("[readiness] {} not ready, retrying in {:?}", name, delay);
            race(cancel, tokio::time::sleep(delay)).await?;
        }
    }
}
