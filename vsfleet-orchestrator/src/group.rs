//! The instance-group controller: the operations a fleet autoscaler calls.
//!
//! The controller holds one gateway session and the validated configuration.
//! It keeps no per-instance state of its own; every call reads the backend.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vsfleet_common::{version, ConnectInfo, InstanceObservation, LifecycleState, ProviderInfo, Settings};
use vsfleet_providers::{GatewayConnector, HypervisorGateway};

use crate::config::{GroupConfig, PluginConfig};
use crate::error::GroupError;
use crate::lifecycle;
use crate::naming;
use crate::network;
use crate::provisioner::{self, CloneTarget};
use crate::remote::race;
use crate::teardown;

pub const PROVIDER_ID: &str = "vSphere";
pub const MAX_SIZE: usize = 50;

/// How long a connection descriptor stays valid.
pub fn connect_info_ttl() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

struct Session {
    config: Arc<GroupConfig>,
    settings: Settings,
    gateway: Arc<dyn HypervisorGateway>,
    info: ProviderInfo,
}

/// Result of one clone attempt inside a scale-out batch.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisionOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-unit view of an `increase` batch.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IncreaseReport {
    pub requested: usize,
    pub outcomes: Vec<ProvisionOutcome>,
}

impl IncreaseReport {
    pub fn created(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| o.name.as_str())
            .collect()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded()).count()
    }
}

/// A scale-in batch that stopped at its first failure.
#[derive(Debug, thiserror::Error)]
#[error("teardown of {failed} failed: {source}")]
pub struct DecreaseFailure {
    /// Names removed before the failure, in request order.
    pub processed: Vec<String>,
    pub failed: String,
    /// The failed name followed by every name not attempted.
    pub remaining: Vec<String>,
    #[source]
    pub source: GroupError,
}

pub struct InstanceGroup {
    connector: Arc<dyn GatewayConnector>,
    session: Option<Session>,
}

impl InstanceGroup {
    pub fn new(connector: Arc<dyn GatewayConnector>) -> Self {
        Self {
            connector,
            session: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session, GroupError> {
        self.session.as_ref().ok_or(GroupError::NotInitialized)
    }

    pub fn config(&self) -> Option<&GroupConfig> {
        self.session.as_ref().map(|s| s.config.as_ref())
    }

    pub fn provider_info(&self) -> Option<&ProviderInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Validate the configuration and open the gateway session.
    ///
    /// Nothing is contacted when validation fails. A previous session, if any,
    /// is closed once the new one is established.
    pub async fn init(
        &mut self,
        raw: &PluginConfig,
        settings: Settings,
        cancel: &CancellationToken,
    ) -> Result<ProviderInfo, GroupError> {
        let config = GroupConfig::resolve(raw, &settings)?;
        let gateway = race(cancel, self.connector.connect(&config.endpoint)).await??;

        let info = ProviderInfo {
            id: PROVIDER_ID.to_string(),
            max_size: MAX_SIZE,
            version: version::provider_version(),
            build_info: version::build_info(),
        };
        tracing::info!(
            "✅ [group] Initialized {} group '{}' in {} ({}, version {})",
            config.deployment.deploy_type(),
            config.prefix,
            config.folder,
            info.id,
            info.version
        );

        let previous = self.session.replace(Session {
            config: Arc::new(config),
            settings,
            gateway,
            info: info.clone(),
        });
        if let Some(previous) = previous {
            if let Err(e) = previous.gateway.logout().await {
                tracing::warn!("⚠️ [group] Closing previous session failed: {}", e);
            }
        }
        Ok(info)
    }

    /// Report every group member and its lifecycle state, in backend enumeration order.
    ///
    /// Folder children that are not VMs, and VMs whose name lacks the group
    /// prefix, are skipped. A VM removed between listing and reading is skipped too.
    pub async fn update<F>(&self, cancel: &CancellationToken, mut observer: F) -> Result<(), GroupError>
    where
        F: FnMut(&str, LifecycleState),
    {
        let session = self.session()?;
        let folder_path = naming::folder_path(&session.config.folder);
        let folder = race(cancel, session.gateway.find_folder(folder_path))
            .await?
            .map_err(|e| GroupError::lookup(folder_path, e))?;
        let children = race(cancel, session.gateway.list_children(&folder)).await??;

        for child in children.iter().filter(|c| c.is_vm()) {
            let summary = match race(cancel, session.gateway.vm_summary(child)).await? {
                Ok(summary) => summary,
                Err(e) if e.is_not_found() => {
                    tracing::debug!("[group] {} disappeared during update", child.id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !naming::is_managed(&summary.name, &session.config.prefix) {
                continue;
            }
            let state = lifecycle::classify(summary.power_state, &summary.guest_net);
            observer(&summary.name, state);
        }
        Ok(())
    }

    /// `update` collected into a list.
    pub async fn observe(&self, cancel: &CancellationToken) -> Result<Vec<InstanceObservation>, GroupError> {
        let mut seen = Vec::new();
        self.update(cancel, |name, state| {
            seen.push(InstanceObservation {
                name: name.to_string(),
                state,
            })
        })
        .await?;
        Ok(seen)
    }

    /// Start `n` clones concurrently and report `n` once all of them finished.
    ///
    /// Only failing to resolve the template or the destination folder is an
    /// error. Individual clone failures are logged; `update` reveals which
    /// instances actually exist.
    pub async fn increase(&self, n: usize, cancel: &CancellationToken) -> Result<usize, GroupError> {
        Ok(self.increase_with_report(n, cancel).await?.requested)
    }

    /// Same as [`InstanceGroup::increase`] with the outcome of every clone.
    pub async fn increase_with_report(
        &self,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<IncreaseReport, GroupError> {
        let session = self.session()?;
        let config = &session.config;

        let source = race(cancel, session.gateway.find_vm(&config.template))
            .await?
            .map_err(|e| GroupError::lookup(config.template.as_str(), e))?;
        let folder_path = naming::folder_path(&config.folder);
        let folder = race(cancel, session.gateway.find_folder(folder_path))
            .await?
            .map_err(|e| GroupError::lookup(folder_path, e))?;
        let target = Arc::new(CloneTarget {
            source,
            source_name: template_name(&config.template).to_string(),
            folder,
            datacenter: config.datacenter.clone(),
        });

        let limiter = config
            .max_parallel_clones
            .map(|cap| Arc::new(Semaphore::new(cap)));
        let mut workers = JoinSet::new();
        for _ in 0..n {
            let name = naming::instance_name(&config.prefix);
            let gateway = session.gateway.clone();
            let config = config.clone();
            let target = target.clone();
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let result = async {
                    let _permit = match limiter {
                        Some(limiter) => race(&cancel, limiter.acquire_owned()).await?.ok(),
                        None => None,
                    };
                    provisioner::provision(gateway.as_ref(), &config.deployment, &target, &name, &cancel)
                        .await
                }
                .await;
                ProvisionOutcome {
                    name,
                    error: result.err().map(|e| e.to_string()),
                }
            });
        }

        let mut report = IncreaseReport {
            requested: n,
            outcomes: Vec::with_capacity(n),
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(error) = &outcome.error {
                        tracing::error!("❌ [group] Clone {} failed: {}", outcome.name, error);
                    }
                    report.outcomes.push(outcome);
                }
                Err(e) => tracing::error!("❌ [group] Clone worker aborted: {}", e),
            }
        }

        tracing::info!(
            "📈 [group] Increase by {}: {} created, {} failed",
            n,
            report.created().len(),
            report.failed()
        );
        Ok(report)
    }

    /// Tear down the named instances one after another, stopping at the first failure.
    pub async fn decrease(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DecreaseFailure> {
        let session = match self.session() {
            Ok(session) => session,
            Err(source) => {
                return Err(DecreaseFailure {
                    processed: Vec::new(),
                    failed: names.first().cloned().unwrap_or_default(),
                    remaining: names.to_vec(),
                    source,
                })
            }
        };

        let mut processed = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if let Err(source) =
                teardown::teardown(session.gateway.as_ref(), &session.config.folder, name, cancel).await
            {
                tracing::error!("❌ [group] Decrease stopped at {}: {}", name, source);
                return Err(DecreaseFailure {
                    processed,
                    failed: name.clone(),
                    remaining: names[i..].to_vec(),
                    source,
                });
            }
            processed.push(name.clone());
        }
        tracing::info!("📉 [group] Decreased by {}", processed.len());
        Ok(processed)
    }

    /// Connection descriptor for one instance, built from its first guest IPv4 address.
    ///
    /// Fails with [`GroupError::NoAddress`] while the guest has not reported one yet;
    /// callers are expected to retry.
    pub async fn connect_info(&self, name: &str, cancel: &CancellationToken) -> Result<ConnectInfo, GroupError> {
        let session = self.session()?;
        let path = naming::instance_path(&session.config.folder, name);
        let vm = race(cancel, session.gateway.find_vm(&path))
            .await?
            .map_err(|e| GroupError::lookup(path.as_str(), e))?;
        let nics = race(cancel, session.gateway.guest_nics(&vm)).await??;
        let ip = network::resolve_ipv4(&nics).ok_or_else(|| GroupError::NoAddress(name.to_string()))?;

        Ok(ConnectInfo {
            connector_config: session.settings.connector_config.clone(),
            id: name.to_string(),
            internal_addr: ip.to_string(),
            external_addr: None,
            expires: Some(Utc::now() + connect_info_ttl()),
        })
    }

    /// Close the gateway session. Safe to call when never initialized.
    pub async fn shutdown(&mut self) -> Result<(), GroupError> {
        if let Some(session) = self.session.take() {
            session.gateway.logout().await?;
            tracing::info!("👋 [group] Session closed");
        }
        Ok(())
    }
}

/// Display name of the template: the last segment of its inventory path.
fn template_name(template: &str) -> &str {
    template
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{full_clone_config, static_settings};
    use vsfleet_providers::inventory::PowerState;
    use vsfleet_providers::mock::Simulator;

    async fn group(sim: &Simulator) -> InstanceGroup {
        let mut group = InstanceGroup::new(Arc::new(sim.clone()));
        group
            .init(&full_clone_config(), static_settings(), &CancellationToken::new())
            .await
            .unwrap();
        group
    }

    #[test]
    fn template_name_is_last_segment() {
        assert_eq!(template_name("/DC0/vm/golden"), "golden");
        assert_eq!(template_name("golden"), "golden");
        assert_eq!(template_name("/DC0/vm/golden/"), "golden");
    }

    #[tokio::test]
    async fn init_reports_provider_info() {
        let sim = Simulator::vpx();
        let mut group = InstanceGroup::new(Arc::new(sim.clone()));
        let info = group
            .init(&full_clone_config(), static_settings(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.id, "vSphere");
        assert_eq!(info.max_size, 50);
        assert_eq!(sim.sessions(), 1);
        assert!(group.is_initialized());
    }

    #[tokio::test]
    async fn invalid_config_never_connects() {
        let sim = Simulator::vpx();
        let mut group = InstanceGroup::new(Arc::new(sim.clone()));
        let raw = PluginConfig {
            folder: None,
            ..full_clone_config()
        };
        let err = group
            .init(&raw, static_settings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::MissingField("folder")));
        assert_eq!(sim.sessions(), 0);
        assert!(!group.is_initialized());
    }

    #[tokio::test]
    async fn operations_require_init() {
        let group = InstanceGroup::new(Arc::new(Simulator::vpx()));
        let cancel = CancellationToken::new();
        assert!(matches!(
            group.increase(1, &cancel).await,
            Err(GroupError::NotInitialized)
        ));
        assert!(matches!(
            group.connect_info("x", &cancel).await,
            Err(GroupError::NotInitialized)
        ));
        let failure = group.decrease(&["x".to_string()], &cancel).await.unwrap_err();
        assert!(matches!(failure.source, GroupError::NotInitialized));
        assert_eq!(failure.remaining, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn update_classifies_members_only() {
        let sim = Simulator::vpx();
        sim.add_vm("/DC0/vm", "test-vm-1", PowerState::PoweredOn);
        sim.add_vm("/DC0/vm", "test-vm-2", PowerState::PoweredOn);
        sim.add_vm("/DC0/vm", "test-vm-3", PowerState::PoweredOff);
        sim.add_vm("/DC0/vm", "other-vm", PowerState::PoweredOn);
        sim.add_folder("/DC0/vm/test-vm-folder");
        sim.set_guest_ip("test-vm-2", "10.0.0.2");

        let group = group(&sim).await;
        let seen = group.observe(&CancellationToken::new()).await.unwrap();
        let seen: Vec<(&str, LifecycleState)> =
            seen.iter().map(|o| (o.name.as_str(), o.state)).collect();
        assert_eq!(
            seen,
            vec![
                ("test-vm-1", LifecycleState::Creating),
                ("test-vm-2", LifecycleState::Running),
                ("test-vm-3", LifecycleState::Deleting),
            ]
        );
    }

    #[tokio::test]
    async fn decrease_stops_at_first_failure() {
        let sim = Simulator::vpx();
        sim.add_vm("/DC0/vm", "test-vm-1", PowerState::PoweredOn);
        sim.add_vm("/DC0/vm", "test-vm-3", PowerState::PoweredOn);
        let group = group(&sim).await;

        let names: Vec<String> = ["test-vm-1", "test-vm-2", "test-vm-3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let failure = group
            .decrease(&names, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.processed, vec!["test-vm-1".to_string()]);
        assert_eq!(failure.failed, "test-vm-2");
        assert_eq!(failure.remaining, names[1..].to_vec());
        assert!(failure.source.is_not_found());
        // never attempted
        assert_eq!(sim.power_state_of("test-vm-3"), Some(PowerState::PoweredOn));
    }

    #[tokio::test]
    async fn connect_info_carries_connector_settings() {
        let sim = Simulator::vpx();
        sim.add_vm("/DC0/vm", "test-vm-1", PowerState::PoweredOn);
        sim.set_guest_ip("test-vm-1", "10.0.0.7");
        let group = group(&sim).await;

        let before = Utc::now();
        let info = group
            .connect_info("test-vm-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.id, "test-vm-1");
        assert_eq!(info.internal_addr, "10.0.0.7");
        assert!(info.connector_config.use_static_credentials);
        let expires = info.expires.unwrap();
        assert!(expires >= before + chrono::Duration::minutes(5));
        assert!(expires <= Utc::now() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let sim = Simulator::vpx();
        let mut group = group(&sim).await;
        group.shutdown().await.unwrap();
        group.shutdown().await.unwrap();
        assert_eq!(sim.logouts(), 1);
        assert!(!group.is_initialized());
    }
}
